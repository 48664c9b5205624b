//! Cross-worker request budget
//!
//! Every worker sharing a counter store draws from one budget per window. The
//! store's increment-and-expire is a single atomic step so concurrent callers
//! never double count or leave a counter without an expiry. When the store is
//! unreachable the governor fails open: losing throughput control is better
//! than stalling the pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use platform::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::{CancelFlag, sleep_or_cancel};
use crate::config::{GOVERNOR_POLL_CAP, GovernorConfig};
use crate::telemetry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Counter value after an increment, with the time left in its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl: Option<Duration>,
}

/// Shared store holding windowed counters.
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, starting a `window`-long expiry when this
    /// increment created the counter.
    fn incr_window<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
    ) -> BoxFuture<'a, Result<WindowCount, StoreError>>;

    /// Round-trip to the store without touching any counter.
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    fn kind(&self) -> &'static str;
}

/// In-process counters, for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn incr_window<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
    ) -> BoxFuture<'a, Result<WindowCount, StoreError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut counters = self
                .counters
                .lock()
                .map_err(|_| StoreError::Unavailable("counter map poisoned".into()))?;
            let entry = counters.entry(key.to_string()).or_insert((0, now + window));
            if now >= entry.1 {
                *entry = (0, now + window);
            }
            entry.0 += 1;
            Ok(WindowCount {
                count: entry.0,
                ttl: Some(entry.1 - now),
            })
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.counters
                .lock()
                .map(|_| ())
                .map_err(|_| StoreError::Unavailable("counter map poisoned".into()))
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// INCR, then PEXPIRE only when the counter is new (or lost its expiry), then
/// PTTL, all inside one script so no other client interleaves.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Redis-backed counters shared by every worker pointed at the same server.
pub struct RedisCounterStore {
    conn: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            script: redis::Script::new(INCR_WINDOW_SCRIPT),
        })
    }
}

impl CounterStore for RedisCounterStore {
    fn incr_window<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
    ) -> BoxFuture<'a, Result<WindowCount, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
            let (count, ttl): (i64, i64) = self
                .script
                .key(key)
                .arg(window_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok(WindowCount {
                count: u64::try_from(count).unwrap_or(0),
                ttl: u64::try_from(ttl).ok().map(Duration::from_millis),
            })
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Blocked { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Acquired,
    TimedOut,
    Cancelled,
}

/// Point-in-time view of the governor for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorHealth {
    pub store: &'static str,
    pub reachable: bool,
    pub key: String,
    pub max_requests: u64,
    pub window_secs: u64,
}

pub struct RateGovernor {
    store: Arc<dyn CounterStore>,
    key: String,
    max_requests: u64,
    window: Duration,
    max_wait: Duration,
}

impl RateGovernor {
    pub fn new(store: Arc<dyn CounterStore>, config: &GovernorConfig) -> Self {
        Self {
            store,
            key: config.key.clone(),
            max_requests: config.max_requests,
            window: config.window(),
            max_wait: config.max_wait(),
        }
    }

    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// Blocked attempts still count toward the window, so a crowd of waiting
    /// workers cannot all slip through the moment a window rolls over.
    pub async fn check_limit(&self, key: &str, max: u64, window: Duration) -> Decision {
        match self.store.incr_window(key, window).await {
            Ok(count) if count.count <= max => Decision::Allowed,
            Ok(count) => {
                telemetry::record_governor_blocked();
                let retry_in = count.ttl.unwrap_or(window);
                debug!(key, count = count.count, max, retry_in_ms = retry_in.as_millis() as u64, "request budget exhausted");
                Decision::Blocked { retry_in }
            }
            Err(e) => {
                warn!(key, error = %e, "rate governor store unavailable, failing open");
                Decision::Allowed
            }
        }
    }

    /// Poll until `key` has budget, the wait exceeds `max_wait`, or the run
    /// is cancelled. Polls at the remaining window ttl, capped at one second.
    pub async fn wait_for_slot(
        &self,
        key: &str,
        max: u64,
        window: Duration,
        max_wait: Duration,
        cancel: &CancelFlag,
    ) -> SlotOutcome {
        let deadline = Instant::now() + max_wait;
        loop {
            if cancel.is_cancelled() {
                return SlotOutcome::Cancelled;
            }
            let retry_in = match self.check_limit(key, max, window).await {
                Decision::Allowed => return SlotOutcome::Acquired,
                Decision::Blocked { retry_in } => retry_in,
            };
            let now = Instant::now();
            if now >= deadline {
                return SlotOutcome::TimedOut;
            }
            let pause = retry_in.min(GOVERNOR_POLL_CAP).min(deadline - now);
            if !sleep_or_cancel(pause, cancel).await {
                return SlotOutcome::Cancelled;
            }
        }
    }

    pub async fn health(&self) -> GovernorHealth {
        let reachable = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(store = self.store.kind(), error = %e, "rate governor store unreachable");
                false
            }
        };
        GovernorHealth {
            store: self.store.kind(),
            reachable,
            key: self.key.clone(),
            max_requests: self.max_requests,
            window_secs: self.window.as_secs(),
        }
    }

    /// `wait_for_slot` against the configured key and budget.
    pub async fn acquire(&self, cancel: &CancelFlag) -> SlotOutcome {
        self.wait_for_slot(
            &self.key,
            self.max_requests,
            self.window,
            self.max_wait,
            cancel,
        )
        .await
    }
}

/// Build the governor a config asks for. A Redis URL that cannot be reached
/// at startup falls back to in-process counting.
pub async fn from_config(config: &GovernorConfig) -> Option<RateGovernor> {
    if !config.enabled {
        return None;
    }
    let store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => match RedisCounterStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "redis unavailable, rate governor counting in-process");
                Arc::new(MemoryCounterStore::new())
            }
        },
        None => Arc::new(MemoryCounterStore::new()),
    };
    Some(RateGovernor::new(store, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownStore;

    impl CounterStore for DownStore {
        fn incr_window<'a>(
            &'a self,
            _key: &'a str,
            _window: Duration,
        ) -> BoxFuture<'a, Result<WindowCount, StoreError>> {
            Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
        }

        fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
        }

        fn kind(&self) -> &'static str {
            "down"
        }
    }

    fn governor(store: Arc<dyn CounterStore>) -> RateGovernor {
        RateGovernor::new(
            store,
            &GovernorConfig {
                max_requests: 3,
                window_secs: 10,
                max_wait_secs: 30,
                ..GovernorConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_resets_after_window() {
        let store = MemoryCounterStore::new();
        let w = Duration::from_secs(10);
        assert_eq!(store.incr_window("k", w).await.unwrap().count, 1);
        assert_eq!(store.incr_window("k", w).await.unwrap().count, 2);
        tokio::time::advance(Duration::from_secs(4)).await;
        let count = store.incr_window("k", w).await.unwrap();
        assert_eq!(count.count, 3);
        assert_eq!(count.ttl, Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.incr_window("k", w).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_past_budget() {
        let gov = governor(Arc::new(MemoryCounterStore::new()));
        let w = Duration::from_secs(10);
        for _ in 0..3 {
            assert_eq!(gov.check_limit("k", 3, w).await, Decision::Allowed);
        }
        assert!(matches!(
            gov.check_limit("k", 3, w).await,
            Decision::Blocked { .. }
        ));
        // Separate keys have separate budgets.
        assert_eq!(gov.check_limit("other", 3, w).await, Decision::Allowed);
    }

    #[tokio::test]
    async fn fails_open_when_store_down() {
        let gov = governor(Arc::new(DownStore));
        for _ in 0..10 {
            assert_eq!(
                gov.check_limit("k", 1, Duration::from_secs(1)).await,
                Decision::Allowed
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_budget() {
        let gov = Arc::new(governor(Arc::new(MemoryCounterStore::new())));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let gov = gov.clone();
            handles.push(tokio::spawn(async move {
                gov.check_limit("shared", 10, Duration::from_secs(60)).await
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == Decision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_slot_resumes_when_window_rolls() {
        let gov = governor(Arc::new(MemoryCounterStore::new()));
        let cancel = CancelFlag::new();
        for _ in 0..3 {
            assert_eq!(gov.acquire(&cancel).await, SlotOutcome::Acquired);
        }
        let start = Instant::now();
        assert_eq!(gov.acquire(&cancel).await, SlotOutcome::Acquired);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_slot_times_out() {
        let gov = governor(Arc::new(MemoryCounterStore::new()));
        let cancel = CancelFlag::new();
        let w = Duration::from_secs(600);
        assert_eq!(
            gov.wait_for_slot("k", 1, w, Duration::from_secs(5), &cancel).await,
            SlotOutcome::Acquired
        );
        let start = Instant::now();
        assert_eq!(
            gov.wait_for_slot("k", 1, w, Duration::from_secs(5), &cancel).await,
            SlotOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test]
    async fn wait_for_slot_observes_cancellation() {
        let gov = governor(Arc::new(MemoryCounterStore::new()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert_eq!(gov.acquire(&cancel).await, SlotOutcome::Cancelled);
    }

    #[tokio::test]
    async fn health_reports_store_reachability() {
        let up = governor(Arc::new(MemoryCounterStore::new())).health().await;
        assert_eq!(up.store, "memory");
        assert!(up.reachable);
        assert_eq!(up.max_requests, 3);
        assert_eq!(up.window_secs, 10);

        let down = governor(Arc::new(DownStore)).health().await;
        assert_eq!(down.store, "down");
        assert!(!down.reachable);
    }

    #[tokio::test]
    async fn disabled_config_builds_nothing() {
        let config = GovernorConfig {
            enabled: false,
            ..GovernorConfig::default()
        };
        assert!(from_config(&config).await.is_none());
        assert!(from_config(&GovernorConfig::default()).await.is_some());
    }
}
