//! Credential storage for platform sessions
//!
//! Manages a JSON file mapping session ids to credential bundles. All writes
//! use atomic temp-file + rename, and a tokio Mutex serializes concurrent
//! edits from the admin API. The session pool snapshots the store once at
//! initialization through `CredentialSource`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use common::Secret;
use identity_pool::CredentialSource;
use platform::{BoxFuture, CredentialBundle, SessionSeed};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One session's credential material as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    /// Account handle the session belongs to.
    pub identity: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
}

impl StoredCredential {
    fn to_seed(&self, id: &str) -> SessionSeed {
        SessionSeed {
            id: id.to_string(),
            identity: self.identity.clone(),
            credentials: CredentialBundle {
                auth_token: Secret::new(self.auth_token.clone()),
                csrf_token: self.csrf_token.clone().map(Secret::new),
            },
        }
    }
}

pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, StoredCredential>>,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// A missing file is created as `{}`; the pool then refuses to start with
    /// `NoCredentialsAvailable` until sessions are added.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: BTreeMap<String, StoredCredential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), sessions = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = BTreeMap::new();
            persist(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn get(&self, session_id: &str) -> Option<StoredCredential> {
        self.state.lock().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.state.lock().await.keys().cloned().collect()
    }

    /// Add or replace a credential and persist to disk.
    pub async fn add(&self, session_id: String, credential: StoredCredential) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(session_id.clone(), credential);
        debug!(session_id, "added credential");
        persist(&self.path, &state).await
    }

    /// Remove a credential and persist to disk. Returns it if it existed.
    pub async fn remove(&self, session_id: &str) -> Result<Option<StoredCredential>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(session_id);
        if removed.is_some() {
            debug!(session_id, "removed credential");
            persist(&self.path, &state).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot as pool seeds, in session id order. Entries with a blank
    /// auth token are skipped.
    pub async fn seeds(&self) -> Vec<SessionSeed> {
        let state = self.state.lock().await;
        state
            .iter()
            .filter_map(|(id, credential)| {
                if credential.auth_token.trim().is_empty() {
                    warn!(session_id = %id, "skipping credential with empty auth token");
                    None
                } else {
                    Some(credential.to_seed(id))
                }
            })
            .collect()
    }
}

impl CredentialSource for CredentialStore {
    fn load_sessions(&self) -> BoxFuture<'_, identity_pool::Result<Vec<SessionSeed>>> {
        Box::pin(async move { Ok(self.seeds().await) })
    }
}

async fn persist(path: &std::path::Path, data: &BTreeMap<String, StoredCredential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
    common::write_atomic(path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing credential file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_pool::SessionPool;

    fn credential(suffix: &str) -> StoredCredential {
        StoredCredential {
            identity: format!("handle_{suffix}"),
            auth_token: format!("tok_{suffix}"),
            csrf_token: Some(format!("ct0_{suffix}")),
        }
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        store.add("s1".into(), credential("1")).await.unwrap();

        let reloaded = CredentialStore::load(path).await.unwrap();
        let cred = reloaded.get("s1").await.unwrap();
        assert_eq!(cred.identity, "handle_1");
        assert_eq!(cred.auth_token, "tok_1");
        assert_eq!(cred.csrf_token.as_deref(), Some("ct0_1"));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let err = CredentialStore::load(path).await.err().unwrap();
        assert!(matches!(err, Error::CredentialParse(_)));
    }

    #[tokio::test]
    async fn add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap();
        store.add("s1".into(), credential("1")).await.unwrap();
        store.add("s2".into(), credential("2")).await.unwrap();
        assert_eq!(store.len().await, 2);

        assert!(store.remove("s1").await.unwrap().is_some());
        assert!(store.remove("s1").await.unwrap().is_none());
        assert_eq!(store.session_ids().await, vec!["s2"]);
    }

    #[tokio::test]
    async fn seeds_skip_blank_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap();
        store.add("b".into(), credential("b")).await.unwrap();
        store.add("a".into(), credential("a")).await.unwrap();
        store
            .add(
                "c".into(),
                StoredCredential {
                    identity: "handle_c".into(),
                    auth_token: "  ".into(),
                    csrf_token: None,
                },
            )
            .await
            .unwrap();

        let seeds = store.seeds().await;
        let ids: Vec<_> = seeds.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(seeds[0].credentials.auth_token.expose(), "tok_a");
    }

    #[tokio::test]
    async fn empty_store_cannot_seed_a_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap();
        let err = SessionPool::initialize(&store, 3).await.err().unwrap();
        assert!(matches!(err, identity_pool::Error::NoCredentialsAvailable));
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = std::sync::Arc::new(CredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .add(format!("s{i}"), credential(&i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: BTreeMap<String, StoredCredential> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
