//! DOM scroll-extraction channel
//!
//! Navigate, wait for content or the empty-result state, then cycle:
//! extract, merge, check for an error banner, scroll, settle. Consecutive
//! cycles that add nothing are judged by a context-dependent threshold; in a
//! timeline a stall first tries a fresh identity with a deep-scroll burst.

use std::collections::HashSet;

use chrono::NaiveDate;
use identity_pool::IdentityBinding;
use platform::{
    AuthContext, Banner, BannerKind, BrowserDriver, ErrorClassification, FetchError, PageState, Target,
    normalize_records,
};
use tracing::{debug, info, warn};

use crate::browser::{BrowserLease, BrowserPool};
use crate::cancel::sleep_or_cancel;
use crate::collector::IngestReport;
use crate::config::DomConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::outcome::ChannelEnd;
use crate::telemetry;

const CHANNEL: &str = "dom";

/// How aggressively empty cycles are read as a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomContext {
    /// Search results or one date chunk. Sparse by nature, so a few empty
    /// cycles are believed. Never rotates.
    Query,
    /// A user timeline. Rarely truly stalls; rotation is tried first.
    Timeline,
    /// The bound identity's own feed. No shared ordering, so never rotates.
    Home,
}

impl DomContext {
    pub fn for_target(target: &Target) -> Self {
        match target {
            Target::Profile { .. } => DomContext::Timeline,
            Target::Search { .. } => DomContext::Query,
            Target::Home => DomContext::Home,
        }
    }

    fn rotates(&self) -> bool {
        *self == DomContext::Timeline
    }

    /// Whether a session the platform rejects may be swapped mid-run. The home
    /// feed belongs to its identity, so swapping would change the target.
    fn replaces_rejected_sessions(&self) -> bool {
        *self != DomContext::Home
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreakVerdict {
    Continue,
    Rotate,
    Boundary,
}

#[derive(Debug)]
pub(crate) struct BoundaryTracker {
    context: DomContext,
    empty_streak: u32,
    yielded: usize,
}

impl BoundaryTracker {
    pub fn new(context: DomContext) -> Self {
        Self {
            context,
            empty_streak: 0,
            yielded: 0,
        }
    }

    pub fn empty_streak(&self) -> u32 {
        self.empty_streak
    }

    pub fn reset_streak(&mut self) {
        self.empty_streak = 0;
    }

    pub fn observe(&mut self, added: usize, config: &DomConfig) -> StreakVerdict {
        self.yielded += added;
        if added > 0 {
            self.empty_streak = 0;
            return StreakVerdict::Continue;
        }
        self.empty_streak += 1;
        let streak = self.empty_streak;
        match self.context {
            DomContext::Query => {
                let sparse = self.yielded < config.chunk_min_items && streak >= config.chunk_empty_cycles;
                if sparse || streak >= config.chunk_boundary_cycles {
                    StreakVerdict::Boundary
                } else {
                    StreakVerdict::Continue
                }
            }
            DomContext::Timeline if streak >= config.timeline_empty_cycles => StreakVerdict::Boundary,
            DomContext::Timeline if streak >= config.timeline_stall_cycles => StreakVerdict::Rotate,
            DomContext::Timeline => StreakVerdict::Continue,
            DomContext::Home if streak >= config.timeline_empty_cycles => StreakVerdict::Boundary,
            DomContext::Home => StreakVerdict::Continue,
        }
    }
}

pub(crate) struct DomRequest<'a> {
    pub target: &'a Target,
    /// Date window for a search chunk, `[since, until)`.
    pub window: Option<(NaiveDate, NaiveDate)>,
    pub context: DomContext,
    pub rotation: bool,
}

/// The lease the loop currently drives. Empty only after a relaunch failed.
struct Browser<'p> {
    pool: &'p BrowserPool,
    lease: Option<BrowserLease>,
}

impl Browser<'_> {
    fn driver(&mut self) -> platform::Result<&mut dyn BrowserDriver> {
        self.lease
            .as_mut()
            .map(BrowserLease::driver)
            .ok_or_else(|| FetchError::Transport("no browser checked out".into()))
    }

    async fn relaunch(&mut self, auth: &AuthContext) -> platform::Result<()> {
        if let Some(old) = self.lease.take() {
            self.pool.checkin(old).await;
        }
        self.lease = Some(self.pool.checkout(auth).await?);
        Ok(())
    }

    async fn finish(mut self, reusable: bool) {
        if let Some(lease) = self.lease.take() {
            if reusable {
                self.pool.checkin(lease).await;
            } else {
                self.pool.discard(lease);
            }
        }
    }
}

/// Scroll-extract `req.target` until a stop condition.
///
/// `binding` is replaced in place on rotation; the caller releases whatever
/// binding is current when this returns.
pub(crate) async fn run_dom(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    pool: &BrowserPool,
    req: &DomRequest<'_>,
) -> Result<ChannelEnd> {
    let engine = ctx.config;
    let config = &engine.dom;
    let url = req
        .target
        .page_url(&config.site_base, req.window)
        .map_err(|e| Error::Config(e.to_string()))?;

    let checkout = ctx
        .timer
        .measure("browser_checkout", pool.checkout(&binding.auth_context()))
        .await;
    let lease = match checkout {
        Ok(lease) => lease,
        Err(e) if e.classify_during(ctx.is_cancelled()) == ErrorClassification::Cancelled => {
            return Err(Error::Cancelled);
        }
        Err(e) => return Err(Error::Launch(e)),
    };
    ctx.note_session(binding.session_id());

    let mut browser = Browser {
        pool,
        lease: Some(lease),
    };
    let end = drive(ctx, binding, &mut browser, req, url.as_str()).await;
    let reusable = !matches!(end, ChannelEnd::Cancelled | ChannelEnd::ErrorsExhausted(_));
    browser.finish(reusable).await;
    Ok(end)
}

async fn drive(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    browser: &mut Browser<'_>,
    req: &DomRequest<'_>,
    url: &str,
) -> ChannelEnd {
    let engine = ctx.config;
    let config = &engine.dom;
    let pools = ctx.pools;

    match open_page(ctx, browser, url, config).await {
        Ok(PageState::Content) => {}
        Ok(PageState::Empty) => {
            telemetry::record_page(CHANNEL, "end");
            ctx.events.info(format!("no results at {url}"));
            return ChannelEnd::EndOfTimeline;
        }
        Err(e) => return fetch_end(ctx, binding, e).await,
    }

    let mut tracker = BoundaryTracker::new(req.context);
    let mut can_rotate = req.rotation && req.context.rotates();
    let replace_rejected = req.rotation && req.context.replaces_rejected_sessions();
    let mut tried: HashSet<String> = HashSet::from([binding.session_id().to_string()]);
    let mut failed_rotations = 0u32;
    let mut banner_recoveries = 0u32;
    let mut consecutive_errors = 0u32;
    let mut cycles = 0u32;

    loop {
        if ctx.is_cancelled() {
            return ChannelEnd::Cancelled;
        }
        if let Some(reason) = ctx.collector.halted() {
            return ChannelEnd::Halted(reason);
        }
        if cycles >= config.max_scroll_cycles {
            ctx.events
                .warn(format!("scroll limit of {cycles} cycles reached"));
            return ChannelEnd::ScrollLimit;
        }
        cycles += 1;

        let mut added = match extract(ctx, browser).await {
            Ok(report) => {
                consecutive_errors = 0;
                report.added
            }
            Err(e) => {
                if e.classify_during(ctx.is_cancelled()) != ErrorClassification::Transient {
                    match replace_session(ctx, binding, browser, &mut tried, url, replace_rejected, e).await {
                        Ok(()) => {
                            tracker.reset_streak();
                            consecutive_errors = 0;
                            continue;
                        }
                        Err(end) => return end,
                    }
                }
                consecutive_errors += 1;
                warn!(run_id = %ctx.run_id, cycle = cycles, error = %e, "extraction cycle failed");
                if consecutive_errors >= config.max_consecutive_errors {
                    return ChannelEnd::ErrorsExhausted(e.to_string());
                }
                if !sleep_or_cancel(config.settle_delay(), &ctx.cancel).await {
                    return ChannelEnd::Cancelled;
                }
                continue;
            }
        };

        let banner = match detect_banner(browser).await {
            Ok(banner) => banner,
            Err(e) => {
                match replace_session(ctx, binding, browser, &mut tried, url, replace_rejected, e).await {
                    Ok(()) => {
                        tracker.reset_streak();
                        continue;
                    }
                    Err(end) => return end,
                }
            }
        };
        if let Some(banner) = banner {
            telemetry::record_page(CHANNEL, "banner");
            warn!(run_id = %ctx.run_id, kind = ?banner.kind, text = %banner.text, "error banner");
            let recovered = banner_recoveries < config.max_banner_recoveries
                && recover_from_banner(ctx, browser, config).await;
            if ctx.is_cancelled() {
                return ChannelEnd::Cancelled;
            }
            if !recovered {
                return match banner.kind {
                    BannerKind::RateLimited => {
                        pools
                            .report_failure(binding, ErrorClassification::RateLimited)
                            .await;
                        ChannelEnd::RateLimited
                    }
                    BannerKind::Error => ChannelEnd::ErrorsExhausted(banner.text),
                };
            }
            banner_recoveries += 1;
            match extract(ctx, browser).await {
                Ok(report) => added += report.added,
                Err(e) => return fetch_end(ctx, binding, e).await,
            }
        }

        ctx.save_checkpoint(false).await;
        ctx.report_progress(format!("dom cycle {cycles}"));
        if let Some(reason) = ctx.collector.halted() {
            return ChannelEnd::Halted(reason);
        }

        match tracker.observe(added, config) {
            StreakVerdict::Continue => {}
            StreakVerdict::Boundary => {
                ctx.events.info(format!(
                    "no new items for {} cycles; boundary reached",
                    tracker.empty_streak()
                ));
                return ChannelEnd::Boundary;
            }
            StreakVerdict::Rotate if can_rotate => {
                debug!(
                    run_id = %ctx.run_id,
                    empty_streak = tracker.empty_streak(),
                    "timeline stalled; trying a fresh identity"
                );
                match rotate_identity(ctx, binding, browser, &mut tried, url).await {
                    DomRotation::Unavailable => {
                        debug!(run_id = %ctx.run_id, "no untried session left for dom rotation");
                        can_rotate = false;
                    }
                    DomRotation::Ended(end) => return end,
                    DomRotation::Rotated { gained } => {
                        tracker.reset_streak();
                        if gained > 0 {
                            info!(run_id = %ctx.run_id, gained, "rotated identity reached further");
                            failed_rotations = 0;
                            continue;
                        }
                        failed_rotations += 1;
                        if failed_rotations >= config.max_failed_rotations {
                            ctx.events.warn(format!(
                                "{failed_rotations} fresh identities reached nothing new; platform depth limit"
                            ));
                            return ChannelEnd::PlatformDepthLimit;
                        }
                        continue;
                    }
                }
            }
            StreakVerdict::Rotate => {}
        }

        if let Some(end) = scroll_and_settle(ctx, browser, binding, config).await {
            return end;
        }
    }
}

enum DomRotation {
    /// Every active session has been tried.
    Unavailable,
    Rotated { gained: usize },
    Ended(ChannelEnd),
}

/// Move to an untried identity and reopen the page in a fresh browser.
async fn switch_identity(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    browser: &mut Browser<'_>,
    tried: &mut HashSet<String>,
    url: &str,
    reason: &'static str,
) -> DomRotation {
    let engine = ctx.config;
    let pools = ctx.pools;

    let Some(next) = acquire_untried(ctx, tried).await else {
        return DomRotation::Unavailable;
    };
    tried.insert(next.session_id().to_string());
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
    if !ctx.pause(engine.api.rotation_delay()).await {
        return DomRotation::Ended(ChannelEnd::Cancelled);
    }

    let auth = binding.auth_context();
    if let Err(e) = ctx
        .timer
        .measure("browser_checkout", browser.relaunch(&auth))
        .await
    {
        return DomRotation::Ended(fetch_end(ctx, binding, e).await);
    }
    if let Err(e) = open_page(ctx, browser, url, &engine.dom).await {
        return DomRotation::Ended(fetch_end(ctx, binding, e).await);
    }
    DomRotation::Rotated { gained: 0 }
}

/// Switch identity after a stall and run a deep-scroll burst to test whether
/// the new identity reaches further.
async fn rotate_identity(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    browser: &mut Browser<'_>,
    tried: &mut HashSet<String>,
    url: &str,
) -> DomRotation {
    match switch_identity(ctx, binding, browser, tried, url, "stall").await {
        DomRotation::Rotated { .. } => {}
        other => return other,
    }
    let engine = ctx.config;
    match deep_scroll_burst(ctx, browser, &engine.dom).await {
        Ok(_) if ctx.is_cancelled() => DomRotation::Ended(ChannelEnd::Cancelled),
        Ok(gained) => DomRotation::Rotated { gained },
        Err(e) => DomRotation::Ended(fetch_end(ctx, binding, e).await),
    }
}

/// Handle a failed driver step. A rejected or rate-limited session is swapped
/// for an untried one when `allowed`; anything else, or an exhausted pool,
/// ends the channel.
async fn replace_session(
    ctx: &mut RunContext<'_>,
    binding: &mut IdentityBinding,
    browser: &mut Browser<'_>,
    tried: &mut HashSet<String>,
    url: &str,
    allowed: bool,
    err: FetchError,
) -> std::result::Result<(), ChannelEnd> {
    let class = err.classify_during(ctx.is_cancelled());
    let rejected = matches!(
        class,
        ErrorClassification::SessionInvalid | ErrorClassification::RateLimited
    );
    if !allowed || !rejected || ctx.is_cancelled() {
        return Err(fetch_end(ctx, binding, err).await);
    }
    telemetry::record_page(CHANNEL, class.label());
    ctx.pools.report_failure(binding, class).await;
    warn!(
        run_id = %ctx.run_id,
        session_id = %binding.session_id(),
        class = class.label(),
        error = %err,
        "session rejected during extraction"
    );
    match switch_identity(ctx, binding, browser, tried, url, class.label()).await {
        DomRotation::Rotated { .. } => Ok(()),
        DomRotation::Unavailable => {
            ctx.events
                .warn(format!("{err}; no untried session left to take over"));
            Err(end_for(class, &err))
        }
        DomRotation::Ended(end) => Err(end),
    }
}

async fn detect_banner(browser: &mut Browser<'_>) -> platform::Result<Option<Banner>> {
    browser.driver()?.detect_error_banner().await
}

async fn scroll_and_settle(
    ctx: &mut RunContext<'_>,
    browser: &mut Browser<'_>,
    binding: &IdentityBinding,
    config: &DomConfig,
) -> Option<ChannelEnd> {
    if let Err(e) = scroll(browser).await {
        return Some(fetch_end(ctx, binding, e).await);
    }
    let settled = ctx
        .timer
        .measure("settle", sleep_or_cancel(config.settle_delay(), &ctx.cancel))
        .await;
    if !settled {
        return Some(ChannelEnd::Cancelled);
    }
    None
}

async fn scroll(browser: &mut Browser<'_>) -> platform::Result<()> {
    browser.driver()?.scroll_to_reveal_more().await
}

async fn click_retry(browser: &mut Browser<'_>) -> platform::Result<bool> {
    browser.driver()?.trigger_retry_affordance().await
}

async fn open_page(
    ctx: &mut RunContext<'_>,
    browser: &mut Browser<'_>,
    url: &str,
    config: &DomConfig,
) -> platform::Result<PageState> {
    let driver = browser.driver()?;
    ctx.timer.measure("navigate", driver.navigate(url)).await?;
    let state = ctx
        .timer
        .measure("wait_content", driver.wait_for_content_or_empty(config.content_timeout()))
        .await?;
    debug!(run_id = %ctx.run_id, url, state = ?state, "page opened");
    Ok(state)
}

async fn extract(ctx: &mut RunContext<'_>, browser: &mut Browser<'_>) -> platform::Result<IngestReport> {
    let driver = browser.driver()?;
    let raw = ctx.timer.measure("extract", driver.extract_visible_items()).await?;
    let normalized = normalize_records(&raw);
    if normalized.dropped > 0 {
        debug!(run_id = %ctx.run_id, dropped = normalized.dropped, "rendered records without id dropped");
    }
    let report = ctx.collector.ingest(normalized.items);
    telemetry::record_page(CHANNEL, if report.added > 0 { "items" } else { "empty" });
    telemetry::record_items(CHANNEL, report.added);
    Ok(report)
}

/// Trigger the banner's retry affordance and let the page settle. False when
/// there is nothing to click or the click fails.
async fn recover_from_banner(ctx: &mut RunContext<'_>, browser: &mut Browser<'_>, config: &DomConfig) -> bool {
    match click_retry(browser).await {
        Ok(true) => {
            ctx.timer.incr("banner_recoveries", 1);
            sleep_or_cancel(config.settle_delay(), &ctx.cancel).await
        }
        Ok(false) => false,
        Err(e) => {
            debug!(run_id = %ctx.run_id, error = %e, "retry affordance failed");
            false
        }
    }
}

/// Scroll `deep_scroll_burst` times, extracting every `burst_extract_every`
/// scrolls and once at the end. Returns the items gained.
async fn deep_scroll_burst(
    ctx: &mut RunContext<'_>,
    browser: &mut Browser<'_>,
    config: &DomConfig,
) -> platform::Result<usize> {
    let mut gained = 0;
    for step in 1..=config.deep_scroll_burst {
        if ctx.is_cancelled() {
            break;
        }
        scroll(browser).await?;
        if !sleep_or_cancel(config.settle_delay(), &ctx.cancel).await {
            break;
        }
        if step % config.burst_extract_every == 0 || step == config.deep_scroll_burst {
            gained += extract(ctx, browser).await?.added;
            if ctx.collector.halted().is_some() {
                break;
            }
        }
    }
    ctx.timer.incr("deep_scroll_bursts", 1);
    debug!(run_id = %ctx.run_id, gained, "deep-scroll burst finished");
    Ok(gained)
}

async fn acquire_untried(ctx: &RunContext<'_>, tried: &HashSet<String>) -> Option<IdentityBinding> {
    match ctx.pools.acquire_untried(tried).await {
        Ok(next) => next,
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "no identity available for rotation");
            None
        }
    }
}

/// Fold a driver failure into a channel end, reporting it to the pools.
async fn fetch_end(ctx: &RunContext<'_>, binding: &IdentityBinding, err: FetchError) -> ChannelEnd {
    let class = err.classify_during(ctx.is_cancelled());
    if class == ErrorClassification::Cancelled || ctx.is_cancelled() {
        info!(run_id = %ctx.run_id, "dom operation interrupted by cancellation");
        return ChannelEnd::Cancelled;
    }
    telemetry::record_page(CHANNEL, class.label());
    ctx.pools.report_failure(binding, class).await;
    warn!(
        run_id = %ctx.run_id,
        session_id = %binding.session_id(),
        class = class.label(),
        error = %err,
        "dom channel stopped on error"
    );
    end_for(class, &err)
}

fn end_for(class: ErrorClassification, err: &FetchError) -> ChannelEnd {
    match class {
        ErrorClassification::NotFound => ChannelEnd::PageUnavailable(err.to_string()),
        ErrorClassification::RateLimited => ChannelEnd::RateLimited,
        _ => ChannelEnd::ErrorsExhausted(err.to_string()),
    }
}
