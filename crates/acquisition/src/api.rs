//! API cursor-pagination channel
//!
//! One loop state, fetching, branching on each response:
//!
//! - progress: items and a new cursor; ingest, advance, reset counters
//! - final page: items but no new cursor; ingest and end
//! - clean end: no items, no new cursor; end of timeline
//! - empty cursor: no items but a new cursor; note which session saw the
//!   requested cursor empty, then rotate and retry the same cursor, or stop
//!   with a pagination depth-limit diagnosis
//!
//! Errors are classified first. Rate limits, dead sessions and runs of
//! consecutive transient errors take the same rotate-or-stop path as empty
//! cursors; other transient errors back off and retry without rotating.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use identity_pool::IdentityBinding;
use platform::{
    ApiClient, ApiConnector, ErrorClassification, FetchError, Page, PayloadParser, Target,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::sleep_or_cancel;
use crate::config::ApiConfig;
use crate::context::{RunContext, jitter};
use crate::error::{Error, Result};
use crate::governor::SlotOutcome;
use crate::outcome::ChannelEnd;
use crate::telemetry;

const CHANNEL: &str = "api";

/// Collaborators the API channel runs against.
#[derive(Clone, Copy)]
pub(crate) struct ApiParts<'a> {
    pub connector: &'a dyn ApiConnector,
    pub parser: &'a dyn PayloadParser,
}

pub(crate) struct ApiRequest<'a> {
    pub target: &'a Target,
    pub page_size: usize,
    pub rotation: bool,
}

/// Shape of one successful response relative to the cursor that was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageShape {
    Progress,
    FinalPage,
    CleanEnd,
    EmptyCursor,
}

pub(crate) fn classify_page(requested: Option<&str>, has_items: bool, next: Option<&str>) -> PageShape {
    let advanced = next.is_some() && next != requested;
    match (has_items, advanced) {
        (true, true) => PageShape::Progress,
        (true, false) => PageShape::FinalPage,
        (false, false) => PageShape::CleanEnd,
        (false, true) => PageShape::EmptyCursor,
    }
}

/// Sessions tried this run, and which of them saw each cursor come back empty.
///
/// A single empty observation never proves end of data; a cursor only counts
/// as exhausted once several distinct sessions agree.
#[derive(Debug, Default)]
pub(crate) struct RotationLedger {
    tried: HashSet<String>,
    empty_at: HashMap<String, HashSet<String>>,
}

impl RotationLedger {
    pub fn new(first_session: &str) -> Self {
        let mut ledger = Self::default();
        ledger.tried.insert(first_session.to_string());
        ledger
    }

    pub fn tried(&self) -> &HashSet<String> {
        &self.tried
    }

    pub fn mark_tried(&mut self, session_id: &str) {
        self.tried.insert(session_id.to_string());
    }

    /// Record an empty observation. Returns the distinct sessions that have
    /// now seen `cursor` empty.
    pub fn record_empty(&mut self, cursor: Option<&str>, session_id: &str) -> usize {
        let sessions = self
            .empty_at
            .entry(cursor.unwrap_or_default().to_string())
            .or_default();
        sessions.insert(session_id.to_string());
        sessions.len()
    }

    pub fn confirmations(&self, cursor: Option<&str>) -> usize {
        self.empty_at
            .get(cursor.unwrap_or_default())
            .map_or(0, HashSet::len)
    }

    pub fn may_rotate_on_empty(&self, config: &ApiConfig, rotation: bool, cursor: Option<&str>) -> bool {
        self.may_rotate_on_error(config, rotation)
            && self.confirmations(cursor) < config.cursor_confirm_sessions
    }

    pub fn may_rotate_on_error(&self, config: &ApiConfig, rotation: bool) -> bool {
        rotation && self.tried.len() < config.max_distinct_sessions
    }
}

enum Rotation {
    Rotated(Box<dyn ApiClient>),
    Exhausted,
    Cancelled,
}

/// Walk the cursor chain for `req.target` until a stop condition.
///
/// `binding` is replaced in place on rotation; the caller releases whatever
/// binding is current when this returns.
pub(crate) async fn run_api(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    parts: ApiParts<'_>,
    req: &ApiRequest<'_>,
) -> Result<ChannelEnd> {
    if matches!(req.target, Target::Home) {
        return Err(Error::Config("the home feed has no API channel".into()));
    }
    let engine = ctx.config;
    let config = &engine.api;
    let pools = ctx.pools;

    let mut client = ctx
        .timer
        .measure("api_connect", parts.connector.connect(&binding.auth_context()))
        .await
        .map_err(Error::Launch)?;
    ctx.note_session(binding.session_id());

    let mut ledger = RotationLedger::new(binding.session_id());
    let mut user_id: Option<String> = None;
    let mut consecutive_errors = 0u32;
    let mut not_found_retries = 0u32;
    let mut duplicate_pages = 0u32;
    let mut empty_streak = 0u32;
    let mut page_no = 0u32;

    loop {
        if ctx.is_cancelled() {
            return Ok(ChannelEnd::Cancelled);
        }
        if let Some(reason) = ctx.collector.halted() {
            return Ok(ChannelEnd::Halted(reason));
        }
        if let Some(governor) = ctx.governor {
            match ctx.timer.measure("governor_wait", governor.acquire(&ctx.cancel)).await {
                SlotOutcome::Acquired => {}
                SlotOutcome::Cancelled => return Ok(ChannelEnd::Cancelled),
                SlotOutcome::TimedOut => {
                    ctx.events
                        .warn("shared request budget exhausted; stopping the API channel");
                    return Ok(ChannelEnd::RateLimited);
                }
            }
        }

        let cursor = ctx.cursor.clone();
        page_no += 1;
        let start = Instant::now();
        let result = fetch_page(
            client.as_ref(),
            parts.parser,
            req,
            &mut user_id,
            cursor.as_deref(),
        )
        .await;
        let elapsed = start.elapsed();
        ctx.timer.record("api_fetch", elapsed);

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                let class = err.classify_during(ctx.is_cancelled());
                telemetry::record_page(CHANNEL, class.label());
                if class == ErrorClassification::Cancelled || ctx.is_cancelled() {
                    info!(run_id = %ctx.run_id, "api fetch interrupted by cancellation");
                    return Ok(ChannelEnd::Cancelled);
                }
                pools.report_failure(binding, class).await;
                warn!(
                    run_id = %ctx.run_id,
                    session_id = %binding.session_id(),
                    page = page_no,
                    class = class.label(),
                    error = %err,
                    "api page fetch failed"
                );

                match class {
                    ErrorClassification::NotFound => {
                        let retryable = matches!(req.target, Target::Search { .. })
                            && not_found_retries < config.transient_retry_limit;
                        if !retryable {
                            return Ok(ChannelEnd::PageUnavailable(err.to_string()));
                        }
                        not_found_retries += 1;
                        if !ctx.pause(config.error_backoff()).await {
                            return Ok(ChannelEnd::Cancelled);
                        }
                        continue;
                    }
                    ErrorClassification::RateLimited | ErrorClassification::SessionInvalid => {
                        if !ledger.may_rotate_on_error(config, req.rotation) {
                            return Ok(exhausted_end(class, &err));
                        }
                        match rotate(ctx, binding, parts.connector, &mut ledger, class.label()).await {
                            Rotation::Rotated(next) => {
                                client = next;
                                consecutive_errors = 0;
                                continue;
                            }
                            Rotation::Exhausted => return Ok(exhausted_end(class, &err)),
                            Rotation::Cancelled => return Ok(ChannelEnd::Cancelled),
                        }
                    }
                    _ => {
                        consecutive_errors += 1;
                        if consecutive_errors < config.max_consecutive_errors {
                            let backoff = Duration::from_millis(
                                u64::from(consecutive_errors) * jitter(config.error_backoff()),
                            );
                            if !ctx
                                .timer
                                .measure("backoff", sleep_or_cancel(backoff, &ctx.cancel))
                                .await
                            {
                                return Ok(ChannelEnd::Cancelled);
                            }
                            continue;
                        }
                        if !ledger.may_rotate_on_error(config, req.rotation) {
                            return Ok(ChannelEnd::ErrorsExhausted(err.to_string()));
                        }
                        match rotate(ctx, binding, parts.connector, &mut ledger, "errors").await {
                            Rotation::Rotated(next) => {
                                client = next;
                                consecutive_errors = 0;
                                continue;
                            }
                            Rotation::Exhausted => {
                                return Ok(ChannelEnd::ErrorsExhausted(err.to_string()));
                            }
                            Rotation::Cancelled => return Ok(ChannelEnd::Cancelled),
                        }
                    }
                }
            }
        };

        consecutive_errors = 0;
        not_found_retries = 0;
        pools.report_success(binding, Some(elapsed)).await;

        let Page { items, next_cursor } = page;
        let shape = classify_page(cursor.as_deref(), !items.is_empty(), next_cursor.as_deref());
        debug!(
            run_id = %ctx.run_id,
            page = page_no,
            items = items.len(),
            cursor = cursor.as_deref().unwrap_or(""),
            next_cursor = next_cursor.as_deref().unwrap_or(""),
            shape = ?shape,
            "api page"
        );

        match shape {
            PageShape::CleanEnd => {
                telemetry::record_page(CHANNEL, "end");
                ctx.events.info(format!(
                    "end of timeline after {page_no} pages, {} items",
                    ctx.collector.len()
                ));
                return Ok(ChannelEnd::EndOfTimeline);
            }
            PageShape::EmptyCursor => {
                telemetry::record_page(CHANNEL, "empty");
                empty_streak += 1;
                let confirmations = ledger.record_empty(cursor.as_deref(), binding.session_id());
                debug!(
                    run_id = %ctx.run_id,
                    cursor = cursor.as_deref().unwrap_or(""),
                    empty_streak,
                    confirmations,
                    tried = ledger.tried().len(),
                    "empty page at cursor"
                );
                if ledger.may_rotate_on_empty(config, req.rotation, cursor.as_deref()) {
                    match rotate(ctx, binding, parts.connector, &mut ledger, "empty_cursor").await {
                        Rotation::Rotated(next) => {
                            client = next;
                            continue;
                        }
                        Rotation::Cancelled => return Ok(ChannelEnd::Cancelled),
                        Rotation::Exhausted => {}
                    }
                }
                ctx.events.warn(format!(
                    "cursor chain ran dry after {} sessions; likely a pagination depth limit, \
                     the DOM channel may reach further",
                    ledger.tried().len()
                ));
                return Ok(ChannelEnd::DepthLimit);
            }
            PageShape::Progress | PageShape::FinalPage => {
                empty_streak = 0;
                telemetry::record_page(CHANNEL, "items");
                let report = ctx.collector.ingest(items);
                telemetry::record_items(CHANNEL, report.added);

                if report.added < config.stall_delta_threshold && report.halted.is_none() {
                    ctx.timer.incr("near_stall", 1);
                    debug!(
                        run_id = %ctx.run_id,
                        page = page_no,
                        added = report.added,
                        duplicates = report.duplicates,
                        "near-stall page"
                    );
                }
                if report.added == 0 {
                    duplicate_pages += 1;
                } else {
                    duplicate_pages = 0;
                }

                if shape == PageShape::Progress {
                    ctx.cursor = next_cursor;
                }
                ctx.save_checkpoint(false).await;
                ctx.report_progress(format!("api page {page_no}"));

                if let Some(reason) = report.halted {
                    return Ok(ChannelEnd::Halted(reason));
                }
                if shape == PageShape::FinalPage {
                    return Ok(ChannelEnd::EndOfTimeline);
                }
                if duplicate_pages >= config.max_duplicate_pages {
                    ctx.events.warn(format!(
                        "{duplicate_pages} consecutive pages added nothing new; ending the cursor chain"
                    ));
                    return Ok(ChannelEnd::EndOfTimeline);
                }
            }
        }
    }
}

fn exhausted_end(class: ErrorClassification, err: &FetchError) -> ChannelEnd {
    if class == ErrorClassification::RateLimited {
        ChannelEnd::RateLimited
    } else {
        ChannelEnd::ErrorsExhausted(err.to_string())
    }
}

async fn fetch_page(
    client: &dyn ApiClient,
    parser: &dyn PayloadParser,
    req: &ApiRequest<'_>,
    user_id: &mut Option<String>,
    cursor: Option<&str>,
) -> platform::Result<Page> {
    let raw = match req.target {
        Target::Profile { handle } => {
            let id = match user_id.clone() {
                Some(id) => id,
                None => {
                    let id = client.resolve_user_id(handle).await?;
                    *user_id = Some(id.clone());
                    id
                }
            };
            client.fetch_timeline_page(&id, req.page_size, cursor).await?
        }
        Target::Search { query } => client.fetch_search_page(query, req.page_size, cursor).await?,
        Target::Home => {
            return Err(FetchError::NotFound("home feed has no API pages".into()));
        }
    };
    parser.parse_page(&raw)
}

/// Swap `binding` for a session this run has not tried yet and connect a
/// client for it. Sessions whose connect fails are skipped.
async fn rotate(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    connector: &dyn ApiConnector,
    ledger: &mut RotationLedger,
    reason: &'static str,
) -> Rotation {
    let engine = ctx.config;
    let config = &engine.api;
    let pools = ctx.pools;
    loop {
        if ctx.is_cancelled() {
            return Rotation::Cancelled;
        }
        if ledger.tried().len() >= config.max_distinct_sessions {
            return Rotation::Exhausted;
        }
        let next = match pools.acquire_untried(ledger.tried()).await {
            Ok(Some(next)) => next,
            Ok(None) => return Rotation::Exhausted,
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "no identity available for rotation");
                return Rotation::Exhausted;
            }
        };
        ledger.mark_tried(next.session_id());
        let previous = std::mem::replace(binding, next);
        pools.release(&previous).await;
        ctx.note_session(binding.session_id());
        ctx.timer.incr("rotations", 1);
        telemetry::record_rotation(CHANNEL, reason);
        ctx.events.info(format!(
            "rotating session {} -> {} ({reason})",
            previous.session_id(),
            binding.session_id()
        ));

        if !ctx.pause(config.rotation_delay()).await {
            return Rotation::Cancelled;
        }
        match connector.connect(&binding.auth_context()).await {
            Ok(client) => return Rotation::Rotated(client),
            Err(e) => {
                warn!(
                    run_id = %ctx.run_id,
                    session_id = %binding.session_id(),
                    error = %e,
                    "api connect failed after rotation"
                );
                pools.report_failure(binding, e.classify()).await;
            }
        }
    }
}
