//! Prometheus metrics exposition
//!
//! The engine records through the `metrics` facade (see
//! `acquisition::telemetry`); this module installs the exporter and adds
//! pool gauges refreshed on every scrape:
//!
//! - `harvest_sessions_active` / `harvest_sessions_retired` (gauge)
//! - `harvest_egress_healthy` (gauge)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use serde_json::Value;

use acquisition::telemetry::{RUN_DURATION_BUCKETS, RUN_DURATION_METRIC};

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(RUN_DURATION_METRIC.to_string()),
        RUN_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `harvest_run_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Publish pool gauges from `IdentityPool::health()` output.
pub fn record_pool_health(health: &Value) {
    let count = |v: &Value| v.as_u64().unwrap_or(0) as f64;
    let sessions = &health["sessions"];
    metrics::gauge!("harvest_sessions_active").set(count(&sessions["sessions_active"]));
    metrics::gauge!("harvest_sessions_retired").set(count(&sessions["sessions_retired"]));
    metrics::gauge!("harvest_egress_healthy").set(count(&health["egress"]["endpoints_healthy"]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;
    use serde_json::json;
    use std::time::Duration;

    /// A recorder local to the test; only one global recorder may exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn run_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        acquisition::telemetry::record_run_duration("api", Duration::from_secs(42));

        let output = handle.render();
        assert!(output.contains("harvest_run_duration_seconds_bucket"));
        assert!(output.contains("mode=\"api\""));
        assert!(output.contains("le=\"1\""), "1s bucket must exist");
        assert!(output.contains("le=\"7200\""), "2h bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn engine_counters_pass_through() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        acquisition::telemetry::record_page("dom", "banner");
        acquisition::telemetry::record_rotation("api", "rate_limited");

        let output = handle.render();
        assert!(output.contains("harvest_pages_total"));
        assert!(output.contains("outcome=\"banner\""));
        assert!(output.contains("harvest_rotations_total"));
        assert!(output.contains("reason=\"rate_limited\""));
    }

    #[test]
    fn pool_gauges_follow_health() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_pool_health(&json!({
            "sessions": { "sessions_active": 3, "sessions_retired": 1 },
            "egress": { "endpoints_healthy": 2 },
        }));

        let output = handle.render();
        assert!(output.contains("harvest_sessions_active 3"), "got: {output}");
        assert!(output.contains("harvest_sessions_retired 1"));
        assert!(output.contains("harvest_egress_healthy 2"));
    }

    #[test]
    fn pool_gauges_tolerate_missing_fields() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_pool_health(&json!({}));
        assert!(handle.render().contains("harvest_sessions_active 0"));
    }
}
