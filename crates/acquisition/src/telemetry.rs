//! Run telemetry
//!
//! Two layers: a per-run `PhaseTimer` returned to the caller inside the run
//! outcome, and process-wide metrics through the `metrics` facade:
//!
//! - `harvest_pages_total` (counter): labels `channel`, `outcome`
//! - `harvest_items_total` (counter): label `channel`
//! - `harvest_rotations_total` (counter): labels `channel`, `reason`
//! - `harvest_run_duration_seconds` (histogram): label `mode`
//! - `harvest_governor_blocked_total` (counter)
//!
//! Without an installed recorder the metric calls are no-ops.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const RUN_DURATION_METRIC: &str = "harvest_run_duration_seconds";

/// Histogram buckets for run duration, from one second to two hours.
pub const RUN_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0, 7200.0,
];

pub fn record_page(channel: &'static str, outcome: &'static str) {
    metrics::counter!("harvest_pages_total", "channel" => channel, "outcome" => outcome)
        .increment(1);
}

pub fn record_items(channel: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!("harvest_items_total", "channel" => channel).increment(count as u64);
    }
}

pub fn record_rotation(channel: &'static str, reason: &'static str) {
    metrics::counter!("harvest_rotations_total", "channel" => channel, "reason" => reason)
        .increment(1);
}

pub fn record_run_duration(mode: &'static str, duration: Duration) {
    metrics::histogram!(RUN_DURATION_METRIC, "mode" => mode).record(duration.as_secs_f64());
}

pub fn record_governor_blocked() {
    metrics::counter!("harvest_governor_blocked_total").increment(1);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseStats {
    pub count: u64,
    #[serde(rename = "total_ms", serialize_with = "as_millis")]
    pub total: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Accumulated time per phase plus named counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseTimer {
    phases: BTreeMap<&'static str, PhaseStats>,
    counters: BTreeMap<&'static str, u64>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: &'static str, elapsed: Duration) {
        let stats = self.phases.entry(phase).or_default();
        stats.count += 1;
        stats.total += elapsed;
    }

    /// Await `fut`, charging its wall time to `phase`.
    pub async fn measure<T>(&mut self, phase: &'static str, fut: impl Future<Output = T>) -> T {
        let start = Instant::now();
        let out = fut.await;
        self.record(phase, start.elapsed());
        out
    }

    pub fn incr(&mut self, counter: &'static str, by: u64) {
        *self.counters.entry(counter).or_default() += by;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseStats> {
        self.phases.get(name)
    }
}
