//! State shared by the channel loops of one run

use std::ops::RangeInclusive;
use std::time::Duration;

use identity_pool::IdentityPool;
use rand::RngExt;
use tracing::warn;

use crate::cancel::{CancelFlag, sleep_or_cancel};
use crate::checkpoint::{CheckpointStore, ProgressCheckpoint, save_checkpoint};
use crate::collector::Collector;
use crate::config::EngineConfig;
use crate::events::EventSink;
use crate::governor::RateGovernor;
use crate::telemetry::PhaseTimer;

pub(crate) struct RunContext<'a> {
    pub run_id: String,
    pub collector: Collector,
    pub timer: PhaseTimer,
    pub sessions_used: Vec<String>,
    /// Cursor the API channel requests next; seeded from a checkpoint on resume.
    pub cursor: Option<String>,
    pub config: &'a EngineConfig,
    pub pools: &'a IdentityPool,
    pub governor: Option<&'a RateGovernor>,
    pub checkpoints: Option<&'a dyn CheckpointStore>,
    pub events: EventSink,
    pub cancel: CancelFlag,
}

impl RunContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn note_session(&mut self, session_id: &str) {
        if !self.sessions_used.iter().any(|s| s == session_id) {
            self.sessions_used.push(session_id.to_string());
        }
    }

    pub fn report_progress(&self, action: impl Into<String>) {
        self.events
            .progress(self.collector.total(), self.collector.limit(), action);
    }

    /// Jittered pause in milliseconds. False when cancelled during the wait.
    pub async fn pause(&self, range_ms: RangeInclusive<u64>) -> bool {
        let ms = jitter(range_ms);
        sleep_or_cancel(Duration::from_millis(ms), &self.cancel).await
    }

    /// Persist progress. A failing store is logged and the run carries on.
    pub async fn save_checkpoint(&mut self, completed: bool) {
        let Some(store) = self.checkpoints else {
            return;
        };
        let checkpoint = ProgressCheckpoint {
            count: self.collector.total(),
            last_item_id: self.collector.last_item_id().map(str::to_string),
            last_cursor: self.cursor.clone(),
            sessions_used: self.sessions_used.clone(),
            seen_ids: self.collector.seen_ids(),
            completed,
            ..ProgressCheckpoint::new(self.run_id.clone())
        };
        let result = self
            .timer
            .measure("checkpoint", save_checkpoint(store, &checkpoint))
            .await;
        if let Err(e) = result {
            warn!(run_id = %self.run_id, error = %e, "checkpoint save failed");
        }
    }
}

pub(crate) fn jitter(range_ms: RangeInclusive<u64>) -> u64 {
    if range_ms.is_empty() {
        return *range_ms.start();
    }
    rand::rng().random_range(range_ms)
}
