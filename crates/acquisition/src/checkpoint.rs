//! Resumable run progress
//!
//! The coordinator writes a `ProgressCheckpoint` after every page or
//! extraction cycle and once more on exit. Stores only see an opaque blob
//! keyed by run id; the JSON encoding stays in this module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use platform::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub run_id: String,
    pub count: usize,
    pub last_item_id: Option<String>,
    /// Cursor the API channel resumes from.
    pub last_cursor: Option<String>,
    pub sessions_used: Vec<String>,
    /// Item ids already emitted, so a resumed run never repeats them.
    #[serde(default)]
    pub seen_ids: Vec<String>,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProgressCheckpoint {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            count: 0,
            last_item_id: None,
            last_cursor: None,
            sessions_used: Vec::new(),
            seen_ids: Vec::new(),
            completed: false,
            updated_at: Utc::now(),
        }
    }
}

/// Blob persistence keyed by run id.
pub trait CheckpointStore: Send + Sync {
    fn get<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
    fn set<'a>(&'a self, run_id: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>>;
}

pub async fn load_checkpoint(
    store: &dyn CheckpointStore,
    run_id: &str,
) -> Result<Option<ProgressCheckpoint>> {
    let Some(blob) = store.get(run_id).await? else {
        return Ok(None);
    };
    let checkpoint: ProgressCheckpoint = serde_json::from_slice(&blob)
        .map_err(|e| Error::Checkpoint(format!("decoding checkpoint for {run_id}: {e}")))?;
    Ok(Some(checkpoint))
}

pub async fn save_checkpoint(store: &dyn CheckpointStore, checkpoint: &ProgressCheckpoint) -> Result<()> {
    let blob = serde_json::to_vec(checkpoint)
        .map_err(|e| Error::Checkpoint(format!("encoding checkpoint: {e}")))?;
    store.set(&checkpoint.run_id, blob).await?;
    debug!(
        run_id = %checkpoint.run_id,
        count = checkpoint.count,
        completed = checkpoint.completed,
        "checkpoint saved"
    );
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let blobs = self
                .blobs
                .lock()
                .map_err(|_| Error::Checkpoint("checkpoint map poisoned".into()))?;
            Ok(blobs.get(run_id).cloned())
        })
    }

    fn set<'a>(&'a self, run_id: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut blobs = self
                .blobs
                .lock()
                .map_err(|_| Error::Checkpoint("checkpoint map poisoned".into()))?;
            blobs.insert(run_id.to_string(), blob);
            Ok(())
        })
    }
}

/// One JSON file per run under a directory, written atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        let name: String = run_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let path = self.path_for(run_id);
            match tokio::fs::read(&path).await {
                Ok(blob) => Ok(Some(blob)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Checkpoint(format!(
                    "reading {}: {e}",
                    path.display()
                ))),
            }
        })
    }

    fn set<'a>(&'a self, run_id: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
                Error::Checkpoint(format!("creating {}: {e}", self.dir.display()))
            })?;
            let path = self.path_for(run_id);
            common::write_atomic(&path, &blob)
                .await
                .map_err(|e| Error::Checkpoint(format!("writing {}: {e}", path.display())))
        })
    }
}
