//! Acquisition coordinator
//!
//! Binds one identity per run, picks the channel strategy and folds whatever
//! happens into a `RunOutcome`. The coordinator itself is shared: every call
//! to `run` gets its own collector, telemetry and cancellation flag.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use identity_pool::{IdentityBinding, IdentityPool};
use platform::{ApiConnector, PayloadParser, Target};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api::{ApiParts, ApiRequest, run_api};
use crate::browser::BrowserPool;
use crate::cancel::CancelFlag;
use crate::checkpoint::{CheckpointStore, load_checkpoint};
use crate::collector::{Collector, StopCondition};
use crate::config::{DEFAULT_PAGE_SIZE, EngineConfig};
use crate::context::RunContext;
use crate::dom::{DomContext, DomRequest, run_dom};
use crate::error::{Error, Result};
use crate::events::{EventSink, RunEvent};
use crate::governor::RateGovernor;
use crate::outcome::{ChannelEnd, RunOutcome};
use crate::telemetry::{self, PhaseTimer};

/// Which channels a run uses. Each variant owns its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChannelStrategy {
    Api {
        page_size: usize,
        rotation: bool,
    },
    Dom {
        rotation: bool,
        /// Split a bounded search into windows of this many days, each run
        /// through the DOM loop in turn.
        chunking: Option<u32>,
    },
    /// API until it stops on its own, then the DOM loop for the remainder.
    Mixed {
        page_size: usize,
        rotation: bool,
    },
}

impl ChannelStrategy {
    pub fn api() -> Self {
        ChannelStrategy::Api {
            page_size: DEFAULT_PAGE_SIZE,
            rotation: true,
        }
    }

    pub fn dom() -> Self {
        ChannelStrategy::Dom {
            rotation: true,
            chunking: None,
        }
    }

    pub fn mixed() -> Self {
        ChannelStrategy::Mixed {
            page_size: DEFAULT_PAGE_SIZE,
            rotation: true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelStrategy::Api { .. } => "api",
            ChannelStrategy::Dom { .. } => "dom",
            ChannelStrategy::Mixed { .. } => "mixed",
        }
    }

    fn uses_api(&self) -> bool {
        !matches!(self, ChannelStrategy::Dom { .. })
    }

    fn uses_dom(&self) -> bool {
        !matches!(self, ChannelStrategy::Api { .. })
    }
}

/// One acquisition run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub target: Target,
    pub limit: usize,
    pub strategy: ChannelStrategy,
    pub stop: StopCondition,
    /// Seed from the run's checkpoint when one exists.
    pub resume: bool,
    pub cancel: CancelFlag,
    pub events: Option<UnboundedSender<RunEvent>>,
}

impl RunRequest {
    pub fn new(target: Target, limit: usize, strategy: ChannelStrategy) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            target,
            limit,
            strategy,
            stop: StopCondition::default(),
            resume: false,
            cancel: CancelFlag::new(),
            events: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_stop(mut self, stop: StopCondition) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    /// Handle for cancelling this run from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

pub struct Coordinator {
    pools: Arc<IdentityPool>,
    config: EngineConfig,
    connector: Option<Arc<dyn ApiConnector>>,
    parser: Option<Arc<dyn PayloadParser>>,
    browsers: Option<Arc<BrowserPool>>,
    governor: Option<Arc<RateGovernor>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Coordinator {
    pub fn new(pools: Arc<IdentityPool>, config: EngineConfig) -> Self {
        Self {
            pools,
            config,
            connector: None,
            parser: None,
            browsers: None,
            governor: None,
            checkpoints: None,
        }
    }

    pub fn with_api(mut self, connector: Arc<dyn ApiConnector>, parser: Arc<dyn PayloadParser>) -> Self {
        self.connector = Some(connector);
        self.parser = Some(parser);
        self
    }

    pub fn with_browsers(mut self, browsers: Arc<BrowserPool>) -> Self {
        self.browsers = Some(browsers);
        self
    }

    pub fn with_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn pools(&self) -> &Arc<IdentityPool> {
        &self.pools
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one run. Never fails: every error is folded into the outcome.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let started = Instant::now();
        let mode = request.strategy.label();
        info!(
            run_id = %request.run_id,
            target = request.target.label(),
            mode,
            limit = request.limit,
            "run started"
        );

        let mut ctx = RunContext {
            run_id: request.run_id.clone(),
            collector: Collector::new(request.limit, request.stop.clone()),
            timer: PhaseTimer::new(),
            sessions_used: Vec::new(),
            cursor: None,
            config: &self.config,
            pools: &self.pools,
            governor: self.governor.as_deref(),
            checkpoints: self.checkpoints.as_deref(),
            events: EventSink::new(request.run_id.clone(), request.events.clone()),
            cancel: request.cancel.clone(),
        };

        let result = self.execute(&mut ctx, &request).await;
        let completed = matches!(&result, Ok(end) if *end != ChannelEnd::Cancelled);
        if result.is_ok() || !ctx.collector.is_empty() {
            ctx.save_checkpoint(completed).await;
        }

        let elapsed = started.elapsed();
        telemetry::record_run_duration(mode, elapsed);
        let RunContext {
            run_id,
            collector,
            timer,
            sessions_used,
            ..
        } = ctx;
        let items = collector.into_items();

        let outcome = match &result {
            Ok(end) => RunOutcome::from_end(run_id, end, items, sessions_used, timer),
            Err(err) => RunOutcome::from_error(run_id, err, items, sessions_used, timer),
        };
        if outcome.success {
            info!(
                run_id = %outcome.run_id,
                items = outcome.items.len(),
                diagnostic = outcome.diagnostic.map(|d| d.label()).unwrap_or(""),
                elapsed_ms = elapsed.as_millis() as u64,
                "run finished"
            );
        } else {
            warn!(
                run_id = %outcome.run_id,
                items = outcome.items.len(),
                error = outcome.error.as_deref().unwrap_or(""),
                retryable = outcome.retryable,
                elapsed_ms = elapsed.as_millis() as u64,
                "run failed"
            );
        }
        outcome
    }

    async fn execute(&self, ctx: &mut RunContext<'_>, request: &RunRequest) -> Result<ChannelEnd> {
        self.validate(request)?;
        if request.resume {
            self.resume(ctx).await?;
        }
        if ctx.is_cancelled() {
            return Ok(ChannelEnd::Cancelled);
        }

        let preferred = ctx.sessions_used.last().cloned();
        let mut binding = ctx.pools.acquire(preferred.as_deref()).await?;
        let result = self.dispatch(ctx, &mut binding, request).await;
        ctx.pools.release(&binding).await;
        result
    }

    fn validate(&self, request: &RunRequest) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        if request.limit == 0 {
            return Err(Error::Config("limit must be greater than 0".into()));
        }
        let strategy = request.strategy;
        if strategy.uses_api() {
            if matches!(request.target, Target::Home) {
                return Err(Error::Config(format!(
                    "the home feed has no API channel; {} mode needs a profile or search target",
                    strategy.label()
                )));
            }
            if self.connector.is_none() || self.parser.is_none() {
                return Err(Error::Config("no API connector configured".into()));
            }
        }
        if strategy.uses_dom() && self.browsers.is_none() {
            return Err(Error::Config("no browser pool configured".into()));
        }
        match strategy {
            ChannelStrategy::Api { page_size: 0, .. } | ChannelStrategy::Mixed { page_size: 0, .. } => {
                Err(Error::Config("page_size must be greater than 0".into()))
            }
            ChannelStrategy::Dom {
                chunking: Some(days),
                ..
            } => {
                if days == 0 {
                    return Err(Error::Config("chunking needs at least one day per chunk".into()));
                }
                if !matches!(request.target, Target::Search { .. }) {
                    return Err(Error::Config("date chunking applies to search targets only".into()));
                }
                let bounds = request.stop.bounds;
                match (bounds.since, bounds.until) {
                    (Some(since), Some(until)) if since < until => Ok(()),
                    _ => Err(Error::Config("date chunking needs since < until bounds".into())),
                }
            }
            _ => Ok(()),
        }
    }

    async fn resume(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let Some(store) = ctx.checkpoints else {
            return Ok(());
        };
        let Some(checkpoint) = load_checkpoint(store, &ctx.run_id).await? else {
            return Ok(());
        };
        info!(
            run_id = %ctx.run_id,
            count = checkpoint.count,
            completed = checkpoint.completed,
            cursor = checkpoint.last_cursor.as_deref().unwrap_or(""),
            "resuming from checkpoint"
        );
        ctx.collector.resume_from(checkpoint.count, checkpoint.seen_ids);
        ctx.cursor = checkpoint.last_cursor;
        for session_id in &checkpoint.sessions_used {
            ctx.note_session(session_id);
        }
        ctx.events.info(format!(
            "resuming: {} items already emitted",
            checkpoint.count
        ));
        Ok(())
    }

    async fn dispatch(
        &self,
        ctx: &mut RunContext<'_>,
        binding: &mut IdentityBinding,
        request: &RunRequest,
    ) -> Result<ChannelEnd> {
        match request.strategy {
            ChannelStrategy::Api {
                page_size,
                rotation,
            } => {
                let req = ApiRequest {
                    target: &request.target,
                    page_size,
                    rotation,
                };
                run_api(ctx, binding, self.api_parts()?, &req).await
            }
            ChannelStrategy::Dom {
                rotation,
                chunking: None,
            } => {
                let req = DomRequest {
                    target: &request.target,
                    window: None,
                    context: DomContext::for_target(&request.target),
                    rotation,
                };
                run_dom(ctx, binding, self.browser_pool()?, &req).await
            }
            ChannelStrategy::Dom {
                rotation,
                chunking: Some(days),
            } => self.run_chunks(ctx, binding, request, days, rotation).await,
            ChannelStrategy::Mixed {
                page_size,
                rotation,
            } => self.run_mixed(ctx, binding, request, page_size, rotation).await,
        }
    }

    async fn run_mixed(
        &self,
        ctx: &mut RunContext<'_>,
        binding: &mut IdentityBinding,
        request: &RunRequest,
        page_size: usize,
        rotation: bool,
    ) -> Result<ChannelEnd> {
        let req = ApiRequest {
            target: &request.target,
            page_size,
            rotation,
        };
        let api_end = match run_api(ctx, binding, self.api_parts()?, &req).await {
            Ok(end) => end,
            Err(Error::Launch(e)) => {
                ctx.events
                    .warn(format!("API channel unavailable ({e}); continuing with the DOM channel"));
                ChannelEnd::ErrorsExhausted(e.to_string())
            }
            Err(e) => return Err(e),
        };

        let remaining = ctx.collector.remaining();
        if !api_end.allows_top_up() || remaining == 0 || ctx.is_cancelled() {
            return Ok(api_end);
        }
        ctx.events.info(format!(
            "API channel stopped ({}); topping up {remaining} items via the DOM channel",
            api_end.diagnostic().label()
        ));
        let req = DomRequest {
            target: &request.target,
            window: None,
            context: DomContext::for_target(&request.target),
            rotation,
        };
        run_dom(ctx, binding, self.browser_pool()?, &req).await
    }

    /// Walk date windows newest first, one DOM pass per window, sharing the
    /// run's dedup set and target.
    async fn run_chunks(
        &self,
        ctx: &mut RunContext<'_>,
        binding: &mut IdentityBinding,
        request: &RunRequest,
        days: u32,
        rotation: bool,
    ) -> Result<ChannelEnd> {
        let bounds = request.stop.bounds;
        let (Some(since), Some(until)) = (bounds.since, bounds.until) else {
            return Err(Error::Config("date chunking needs since and until bounds".into()));
        };
        let windows = date_windows(since.date_naive(), until.date_naive(), days);
        let browsers = self.browser_pool()?;
        let total = windows.len();
        let mut last_failure = None;

        for (i, window) in windows.into_iter().enumerate() {
            if ctx.is_cancelled() {
                return Ok(ChannelEnd::Cancelled);
            }
            if let Some(reason) = ctx.collector.halted() {
                return Ok(ChannelEnd::Halted(reason));
            }
            ctx.events.info(format!(
                "chunk {}/{total}: {} to {}",
                i + 1,
                window.0,
                window.1
            ));
            let req = DomRequest {
                target: &request.target,
                window: Some(window),
                context: DomContext::Query,
                rotation,
            };
            match run_dom(ctx, binding, browsers, &req).await? {
                end @ (ChannelEnd::Cancelled | ChannelEnd::Halted(_) | ChannelEnd::RateLimited) => {
                    return Ok(end);
                }
                end @ (ChannelEnd::ErrorsExhausted(_) | ChannelEnd::PageUnavailable(_)) => {
                    warn!(run_id = %ctx.run_id, chunk = i + 1, diagnostic = end.diagnostic().label(), "chunk failed");
                    last_failure = Some(end);
                }
                _ => {}
            }
        }
        Ok(last_failure.unwrap_or(ChannelEnd::EndOfTimeline))
    }

    fn api_parts(&self) -> Result<ApiParts<'_>> {
        match (&self.connector, &self.parser) {
            (Some(connector), Some(parser)) => Ok(ApiParts {
                connector: connector.as_ref(),
                parser: parser.as_ref(),
            }),
            _ => Err(Error::Config("no API connector configured".into())),
        }
    }

    fn browser_pool(&self) -> Result<&BrowserPool> {
        self.browsers
            .as_deref()
            .ok_or_else(|| Error::Config("no browser pool configured".into()))
    }
}

/// `[start, end)` windows of `days` covering `since..=until`, newest first.
pub(crate) fn date_windows(since: NaiveDate, until: NaiveDate, days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let step = Days::new(u64::from(days.max(1)));
    let mut windows = Vec::new();
    let mut hi = until.succ_opt().unwrap_or(until);
    while hi > since {
        let lo = hi.checked_sub_days(step).map_or(since, |d| d.max(since));
        windows.push((lo, hi));
        hi = lo;
    }
    windows
}
