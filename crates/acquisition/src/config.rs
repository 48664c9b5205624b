//! Engine thresholds
//!
//! Every empirical threshold the channel loops use lives here as a named
//! default. The values are tuned against observed platform behavior and have
//! no ground truth behind them; change them through configuration, not inline.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 20;

pub const DEFAULT_MAX_DISTINCT_SESSIONS: usize = 4;
pub const DEFAULT_CURSOR_CONFIRM_SESSIONS: usize = 3;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const DEFAULT_TRANSIENT_RETRY_LIMIT: u32 = 1;
pub const DEFAULT_ERROR_BACKOFF_MS: (u64, u64) = (500, 1000);
pub const DEFAULT_ROTATION_DELAY_MS: (u64, u64) = (1000, 2500);
pub const DEFAULT_STALL_DELTA_THRESHOLD: usize = 5;
pub const DEFAULT_MAX_DUPLICATE_PAGES: u32 = 3;

pub const DEFAULT_CHUNK_EMPTY_CYCLES: u32 = 2;
pub const DEFAULT_CHUNK_MIN_ITEMS: usize = 20;
pub const DEFAULT_CHUNK_BOUNDARY_CYCLES: u32 = 4;
pub const DEFAULT_TIMELINE_EMPTY_CYCLES: u32 = 6;
pub const DEFAULT_TIMELINE_STALL_CYCLES: u32 = 3;
pub const DEFAULT_DEEP_SCROLL_BURST: u32 = 15;
pub const DEFAULT_BURST_EXTRACT_EVERY: u32 = 3;
pub const DEFAULT_MAX_FAILED_ROTATIONS: u32 = 2;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 800;
pub const DEFAULT_CONTENT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MAX_SCROLL_CYCLES: u32 = 400;
pub const DEFAULT_MAX_BANNER_RECOVERIES: u32 = 3;

pub const DEFAULT_GOVERNOR_MAX_REQUESTS: u64 = 300;
pub const DEFAULT_GOVERNOR_WINDOW_SECS: u64 = 900;
pub const DEFAULT_GOVERNOR_MAX_WAIT_SECS: u64 = 60;
pub const DEFAULT_GOVERNOR_KEY: &str = "harvest:requests";

/// Upper bound on the governor's poll interval while waiting for a slot.
pub const GOVERNOR_POLL_CAP: Duration = Duration::from_secs(1);

/// API pagination thresholds (`[engine.api]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Distinct sessions a run may try before declaring a depth limit.
    pub max_distinct_sessions: usize,
    /// Distinct sessions that must see a cursor empty before it counts as
    /// confirmed.
    pub cursor_confirm_sessions: usize,
    pub max_consecutive_errors: u32,
    /// Same-cursor retries for a mode-specific transient error (not-found
    /// during search) before it becomes terminal.
    pub transient_retry_limit: u32,
    pub error_backoff_min_ms: u64,
    pub error_backoff_max_ms: u64,
    pub rotation_delay_min_ms: u64,
    pub rotation_delay_max_ms: u64,
    /// Pages adding fewer new items than this are logged as a near-stall.
    pub stall_delta_threshold: usize,
    /// Consecutive pages that add nothing new before the loop gives up on a
    /// cursor chain that keeps advancing.
    pub max_duplicate_pages: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_distinct_sessions: DEFAULT_MAX_DISTINCT_SESSIONS,
            cursor_confirm_sessions: DEFAULT_CURSOR_CONFIRM_SESSIONS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            transient_retry_limit: DEFAULT_TRANSIENT_RETRY_LIMIT,
            error_backoff_min_ms: DEFAULT_ERROR_BACKOFF_MS.0,
            error_backoff_max_ms: DEFAULT_ERROR_BACKOFF_MS.1,
            rotation_delay_min_ms: DEFAULT_ROTATION_DELAY_MS.0,
            rotation_delay_max_ms: DEFAULT_ROTATION_DELAY_MS.1,
            stall_delta_threshold: DEFAULT_STALL_DELTA_THRESHOLD,
            max_duplicate_pages: DEFAULT_MAX_DUPLICATE_PAGES,
        }
    }
}

impl ApiConfig {
    pub fn error_backoff(&self) -> RangeInclusive<u64> {
        self.error_backoff_min_ms..=self.error_backoff_max_ms
    }

    pub fn rotation_delay(&self) -> RangeInclusive<u64> {
        self.rotation_delay_min_ms..=self.rotation_delay_max_ms
    }
}

/// DOM scroll-extraction thresholds (`[engine.dom]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DomConfig {
    /// In chunk context, empty cycles that end the chunk when it has yielded
    /// fewer than `chunk_min_items`.
    pub chunk_empty_cycles: u32,
    pub chunk_min_items: usize,
    /// In chunk context, empty cycles that end the chunk regardless of yield.
    pub chunk_boundary_cycles: u32,
    /// In timeline context, empty cycles before concluding a depth limit.
    pub timeline_empty_cycles: u32,
    /// In timeline context, empty cycles that trigger a rotation attempt.
    pub timeline_stall_cycles: u32,
    pub deep_scroll_burst: u32,
    pub burst_extract_every: u32,
    pub max_failed_rotations: u32,
    pub settle_delay_ms: u64,
    pub content_timeout_secs: u64,
    pub max_scroll_cycles: u32,
    pub max_banner_recoveries: u32,
    /// Consecutive failed extraction cycles before the loop gives up.
    pub max_consecutive_errors: u32,
    /// Site root the loop navigates under.
    pub site_base: String,
}

impl Default for DomConfig {
    fn default() -> Self {
        Self {
            chunk_empty_cycles: DEFAULT_CHUNK_EMPTY_CYCLES,
            chunk_min_items: DEFAULT_CHUNK_MIN_ITEMS,
            chunk_boundary_cycles: DEFAULT_CHUNK_BOUNDARY_CYCLES,
            timeline_empty_cycles: DEFAULT_TIMELINE_EMPTY_CYCLES,
            timeline_stall_cycles: DEFAULT_TIMELINE_STALL_CYCLES,
            deep_scroll_burst: DEFAULT_DEEP_SCROLL_BURST,
            burst_extract_every: DEFAULT_BURST_EXTRACT_EVERY,
            max_failed_rotations: DEFAULT_MAX_FAILED_ROTATIONS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            content_timeout_secs: DEFAULT_CONTENT_TIMEOUT_SECS,
            max_scroll_cycles: DEFAULT_MAX_SCROLL_CYCLES,
            max_banner_recoveries: DEFAULT_MAX_BANNER_RECOVERIES,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            site_base: platform::target::DEFAULT_SITE_BASE.to_string(),
        }
    }
}

impl DomConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn content_timeout(&self) -> Duration {
        Duration::from_secs(self.content_timeout_secs)
    }
}

/// Engine configuration (`[engine]`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub dom: DomConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> common::Result<()> {
        let api = &self.api;
        if api.max_distinct_sessions == 0 {
            return Err(config_error("max_distinct_sessions must be greater than 0"));
        }
        if api.cursor_confirm_sessions == 0 {
            return Err(config_error("cursor_confirm_sessions must be greater than 0"));
        }
        if api.max_consecutive_errors == 0 {
            return Err(config_error("max_consecutive_errors must be greater than 0"));
        }
        if api.max_duplicate_pages == 0 {
            return Err(config_error("max_duplicate_pages must be greater than 0"));
        }
        if api.error_backoff_min_ms > api.error_backoff_max_ms {
            return Err(config_error("error_backoff_min_ms must not exceed error_backoff_max_ms"));
        }
        if api.rotation_delay_min_ms > api.rotation_delay_max_ms {
            return Err(config_error(
                "rotation_delay_min_ms must not exceed rotation_delay_max_ms",
            ));
        }

        let dom = &self.dom;
        if dom.chunk_empty_cycles == 0 || dom.chunk_boundary_cycles == 0 {
            return Err(config_error("chunk empty-cycle thresholds must be greater than 0"));
        }
        if dom.timeline_empty_cycles == 0 {
            return Err(config_error("timeline_empty_cycles must be greater than 0"));
        }
        if dom.timeline_stall_cycles == 0 || dom.timeline_stall_cycles > dom.timeline_empty_cycles
        {
            return Err(config_error(
                "timeline_stall_cycles must be between 1 and timeline_empty_cycles",
            ));
        }
        if dom.burst_extract_every == 0 {
            return Err(config_error("burst_extract_every must be greater than 0"));
        }
        if dom.content_timeout_secs == 0 {
            return Err(config_error("content_timeout_secs must be greater than 0"));
        }
        if dom.max_scroll_cycles == 0 {
            return Err(config_error("max_scroll_cycles must be greater than 0"));
        }
        if dom.max_consecutive_errors == 0 {
            return Err(config_error("dom max_consecutive_errors must be greater than 0"));
        }
        match url::Url::parse(&dom.site_base) {
            Ok(base) if matches!(base.scheme(), "http" | "https") && base.has_host() => {}
            _ => {
                return Err(config_error(&format!(
                    "site_base must be an http(s) url, got: {}",
                    dom.site_base
                )));
            }
        }
        Ok(())
    }
}

/// Rate governor budget (`[governor]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub enabled: bool,
    /// Requests allowed per window across every worker sharing the store.
    pub max_requests: u64,
    pub window_secs: u64,
    /// Longest a request waits for a slot before it is treated as rate limited.
    pub max_wait_secs: u64,
    pub key: String,
    /// Shared store. In-process counting when absent.
    pub redis_url: Option<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_GOVERNOR_MAX_REQUESTS,
            window_secs: DEFAULT_GOVERNOR_WINDOW_SECS,
            max_wait_secs: DEFAULT_GOVERNOR_MAX_WAIT_SECS,
            key: DEFAULT_GOVERNOR_KEY.to_string(),
            redis_url: None,
        }
    }
}

impl GovernorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.max_requests == 0 {
            return Err(config_error("governor max_requests must be greater than 0"));
        }
        if self.window_secs == 0 {
            return Err(config_error("governor window_secs must be greater than 0"));
        }
        if self.key.trim().is_empty() {
            return Err(config_error("governor key must not be empty"));
        }
        if let Some(url) = &self.redis_url
            && !url.starts_with("redis://")
            && !url.starts_with("rediss://")
        {
            return Err(config_error(&format!(
                "redis_url must start with redis:// or rediss://, got: {url}"
            )));
        }
        Ok(())
    }
}

fn config_error(msg: &str) -> common::Error {
    common::Error::Config(msg.to_string())
}
