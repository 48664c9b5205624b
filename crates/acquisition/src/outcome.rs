//! Structured run results

use platform::Item;
use serde::Serialize;

use crate::collector::StopReason;
use crate::error::Error;
use crate::telemetry::PhaseTimer;

/// Why a run (or a channel within it) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    EndOfTimeline,
    TargetReached,
    StopConditionMatched,
    /// Heuristic: the API cursor chain ran dry across several sessions. The
    /// data likely continues past an upstream depth limit; the DOM channel
    /// may reach further.
    PaginationDepthLimit,
    RateLimited,
    ErrorsExhausted,
    PageUnavailable,
    Cancelled,
    DomBoundary,
    PlatformDepthLimit,
    ScrollLimit,
    InitFailed,
    InvalidRequest,
}

impl DiagnosticCode {
    pub fn label(&self) -> &'static str {
        match self {
            DiagnosticCode::EndOfTimeline => "end_of_timeline",
            DiagnosticCode::TargetReached => "target_reached",
            DiagnosticCode::StopConditionMatched => "stop_condition_matched",
            DiagnosticCode::PaginationDepthLimit => "pagination_depth_limit",
            DiagnosticCode::RateLimited => "rate_limited",
            DiagnosticCode::ErrorsExhausted => "errors_exhausted",
            DiagnosticCode::PageUnavailable => "page_unavailable",
            DiagnosticCode::Cancelled => "cancelled",
            DiagnosticCode::DomBoundary => "dom_boundary",
            DiagnosticCode::PlatformDepthLimit => "platform_depth_limit",
            DiagnosticCode::ScrollLimit => "scroll_limit",
            DiagnosticCode::InitFailed => "init_failed",
            DiagnosticCode::InvalidRequest => "invalid_request",
        }
    }
}

/// How a channel loop ended. Errors the loop could not classify never get
/// here; they surface as `Error` from setup steps only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    EndOfTimeline,
    Halted(StopReason),
    Cancelled,
    DepthLimit,
    RateLimited,
    ErrorsExhausted(String),
    PageUnavailable(String),
    Boundary,
    PlatformDepthLimit,
    ScrollLimit,
}

impl ChannelEnd {
    pub fn diagnostic(&self) -> DiagnosticCode {
        match self {
            ChannelEnd::EndOfTimeline => DiagnosticCode::EndOfTimeline,
            ChannelEnd::Halted(StopReason::TargetReached) => DiagnosticCode::TargetReached,
            ChannelEnd::Halted(_) => DiagnosticCode::StopConditionMatched,
            ChannelEnd::Cancelled => DiagnosticCode::Cancelled,
            ChannelEnd::DepthLimit => DiagnosticCode::PaginationDepthLimit,
            ChannelEnd::RateLimited => DiagnosticCode::RateLimited,
            ChannelEnd::ErrorsExhausted(_) => DiagnosticCode::ErrorsExhausted,
            ChannelEnd::PageUnavailable(_) => DiagnosticCode::PageUnavailable,
            ChannelEnd::Boundary => DiagnosticCode::DomBoundary,
            ChannelEnd::PlatformDepthLimit => DiagnosticCode::PlatformDepthLimit,
            ChannelEnd::ScrollLimit => DiagnosticCode::ScrollLimit,
        }
    }

    /// Mixed runs hand over to the DOM channel after these.
    pub fn allows_top_up(&self) -> bool {
        !matches!(self, ChannelEnd::Halted(_) | ChannelEnd::Cancelled)
    }

    fn error_message(&self) -> Option<String> {
        match self {
            ChannelEnd::RateLimited => Some("rate limited on every available session".into()),
            ChannelEnd::ErrorsExhausted(msg) => Some(format!("retries exhausted: {msg}")),
            ChannelEnd::PageUnavailable(msg) => Some(format!("page unavailable: {msg}")),
            _ => None,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, ChannelEnd::RateLimited | ChannelEnd::ErrorsExhausted(_))
    }

    /// Partial-failure ends count as success when anything was collected.
    fn is_failure_end(&self) -> bool {
        self.error_message().is_some()
    }
}

/// Result of `Coordinator::run`. Always returned, never an `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub items: Vec<Item>,
    pub error: Option<String>,
    pub diagnostic: Option<DiagnosticCode>,
    pub retryable: bool,
    pub sessions_used: Vec<String>,
    pub telemetry: PhaseTimer,
}

impl RunOutcome {
    pub fn from_end(
        run_id: String,
        end: &ChannelEnd,
        items: Vec<Item>,
        sessions_used: Vec<String>,
        telemetry: PhaseTimer,
    ) -> Self {
        let success = !end.is_failure_end() || !items.is_empty();
        Self {
            run_id,
            success,
            items,
            error: end.error_message(),
            diagnostic: Some(end.diagnostic()),
            retryable: end.retryable(),
            sessions_used,
            telemetry,
        }
    }

    pub fn from_error(
        run_id: String,
        err: &Error,
        items: Vec<Item>,
        sessions_used: Vec<String>,
        telemetry: PhaseTimer,
    ) -> Self {
        let diagnostic = match err {
            Error::Config(_) => DiagnosticCode::InvalidRequest,
            Error::Cancelled => DiagnosticCode::Cancelled,
            _ => DiagnosticCode::InitFailed,
        };
        Self {
            run_id,
            success: matches!(err, Error::Cancelled),
            items,
            error: Some(err.to_string()),
            diagnostic: Some(diagnostic),
            retryable: err.is_retryable(),
            sessions_used,
            telemetry,
        }
    }
}
