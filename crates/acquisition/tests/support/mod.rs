//! Scripted platform fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acquisition::{BrowserPool, CancelFlag, Coordinator, EngineConfig, RunOutcome};
use common::Secret;
use identity_pool::{EgressPool, IdentityPool, PoolConfig, SessionPool};
use platform::{
    ApiClient, ApiConnector, AuthContext, Banner, BoxFuture, BrowserDriver, CredentialBundle,
    DriverLauncher, FetchError, NormalizedPageParser, PageState, SessionSeed,
};
use serde_json::{Value, json};

/// Pool of `n` sessions `s1..sN`, no egress endpoints.
pub fn pools(n: usize) -> Arc<IdentityPool> {
    let seeds = (1..=n)
        .map(|i| SessionSeed {
            id: format!("s{i}"),
            identity: format!("user{i}"),
            credentials: CredentialBundle {
                auth_token: Secret::new(format!("tok{i}")),
                csrf_token: None,
            },
        })
        .collect();
    let config = PoolConfig::default();
    let sessions = SessionPool::from_seeds(seeds, config.session_failure_threshold).unwrap();
    let egress = EgressPool::new(Vec::new(), &config);
    Arc::new(IdentityPool::new(Arc::new(sessions), Arc::new(egress)))
}

pub fn ids(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| i.to_string()).collect()
}

/// Raw API payload in the shape `NormalizedPageParser` reads.
pub fn page<S: AsRef<str>>(ids: &[S], next: Option<&str>) -> Value {
    let items: Vec<Value> = ids.iter().map(|id| json!({ "id": id.as_ref() })).collect();
    json!({ "items": items, "next_cursor": next })
}

pub fn item_ids(outcome: &RunOutcome) -> Vec<&str> {
    outcome.items.iter().map(|i| i.id.as_str()).collect()
}

pub fn assert_unique(outcome: &RunOutcome) {
    let mut seen = std::collections::HashSet::new();
    for item in &outcome.items {
        assert!(seen.insert(item.id.clone()), "duplicate item id {}", item.id);
    }
}

// --- API ---

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub session: String,
    pub cursor: Option<String>,
}

type PageScript = dyn Fn(&str, Option<&str>) -> platform::Result<Value> + Send + Sync;

/// API connector whose pages come from a `(session, cursor)` script.
#[derive(Clone)]
pub struct FakeApi {
    script: Arc<PageScript>,
    calls: Arc<Mutex<Vec<Call>>>,
    refuse_connect: bool,
}

impl FakeApi {
    pub fn new(
        script: impl Fn(&str, Option<&str>) -> platform::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            refuse_connect: false,
        }
    }

    /// A connector that cannot connect at all.
    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::new(|_, _| Err(FetchError::Transport("unreachable".into())))
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_at(&self, cursor: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.cursor.as_deref() == Some(cursor))
            .collect()
    }

    fn serve(&self, session: &str, cursor: Option<&str>) -> platform::Result<Value> {
        self.calls.lock().unwrap().push(Call {
            session: session.to_string(),
            cursor: cursor.map(str::to_string),
        });
        (self.script)(session, cursor)
    }
}

impl ApiConnector for FakeApi {
    fn connect<'a>(&'a self, auth: &'a AuthContext) -> BoxFuture<'a, platform::Result<Box<dyn ApiClient>>> {
        Box::pin(async move {
            if self.refuse_connect {
                return Err(FetchError::Transport("connection refused".into()));
            }
            Ok(Box::new(FakeClient {
                session: auth.session_id.clone(),
                api: self.clone(),
            }) as Box<dyn ApiClient>)
        })
    }
}

struct FakeClient {
    session: String,
    api: FakeApi,
}

impl ApiClient for FakeClient {
    fn resolve_user_id<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, platform::Result<String>> {
        Box::pin(async move { Ok(format!("uid-{handle}")) })
    }

    fn fetch_timeline_page<'a>(
        &'a self,
        _user_id: &'a str,
        _page_size: usize,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, platform::Result<Value>> {
        Box::pin(async move { self.api.serve(&self.session, cursor) })
    }

    fn fetch_search_page<'a>(
        &'a self,
        _query: &'a str,
        _page_size: usize,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, platform::Result<Value>> {
        Box::pin(async move { self.api.serve(&self.session, cursor) })
    }
}

// --- Browser ---

/// What one fake browser renders. Each scroll reveals `step` more items of
/// `feed`; extraction returns everything revealed so far.
#[derive(Clone, Default)]
pub struct DriverScript {
    pub feed: Vec<String>,
    pub step: usize,
    pub empty_state: bool,
    pub wait_error: Option<FetchError>,
    /// Every extraction fails with this.
    pub extract_error: Option<FetchError>,
    /// Returned by successive banner checks, front first; then no banner.
    pub banners: Vec<Banner>,
    pub retry_affordance: bool,
    /// Cancel this flag on the n-th scroll.
    pub cancel_on_scroll: Option<(usize, CancelFlag)>,
}

impl DriverScript {
    pub fn feed(feed: Vec<String>, step: usize) -> Self {
        Self {
            feed,
            step,
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct LaunchLog {
    pub launches: Mutex<Vec<String>>,
    pub extractions: AtomicUsize,
    pub scrolls: AtomicUsize,
}

impl LaunchLog {
    pub fn launched(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

/// Launcher handing out per-session scripted drivers.
#[derive(Default)]
pub struct FakeLauncher {
    pub scripts: HashMap<String, DriverScript>,
    pub default: DriverScript,
    pub fail: Option<FetchError>,
    pub log: Arc<LaunchLog>,
}

impl FakeLauncher {
    pub fn uniform(script: DriverScript) -> Self {
        Self {
            default: script,
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: &str, script: DriverScript) -> Self {
        self.scripts.insert(session.to_string(), script);
        self
    }

    pub fn failing(err: FetchError) -> Self {
        Self {
            fail: Some(err),
            ..Self::default()
        }
    }
}

impl DriverLauncher for FakeLauncher {
    fn launch<'a>(&'a self, auth: &'a AuthContext) -> BoxFuture<'a, platform::Result<Box<dyn BrowserDriver>>> {
        Box::pin(async move {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            self.log.launches.lock().unwrap().push(auth.session_id.clone());
            let script = self
                .scripts
                .get(&auth.session_id)
                .cloned()
                .unwrap_or_else(|| self.default.clone());
            Ok(Box::new(FakeDriver {
                visible: script.step.min(script.feed.len()),
                banners: script.banners.iter().cloned().collect(),
                script,
                scrolls: 0,
                log: self.log.clone(),
            }) as Box<dyn BrowserDriver>)
        })
    }
}

struct FakeDriver {
    script: DriverScript,
    visible: usize,
    scrolls: usize,
    banners: VecDeque<Banner>,
    log: Arc<LaunchLog>,
}

impl BrowserDriver for FakeDriver {
    fn navigate<'a>(&'a mut self, _url: &'a str) -> BoxFuture<'a, platform::Result<()>> {
        self.visible = self.script.step.min(self.script.feed.len());
        Box::pin(async { Ok(()) })
    }

    fn wait_for_content_or_empty(&mut self, _timeout: Duration) -> BoxFuture<'_, platform::Result<PageState>> {
        Box::pin(async move {
            if let Some(err) = &self.script.wait_error {
                return Err(err.clone());
            }
            if self.script.empty_state {
                Ok(PageState::Empty)
            } else {
                Ok(PageState::Content)
            }
        })
    }

    fn extract_visible_items(&mut self) -> BoxFuture<'_, platform::Result<Vec<Value>>> {
        self.log.extractions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.extract_error.clone() {
            return Box::pin(async move { Err(err) });
        }
        let records = self.script.feed[..self.visible]
            .iter()
            .map(|id| json!({ "id": id }))
            .collect();
        Box::pin(async move { Ok(records) })
    }

    fn scroll_to_reveal_more(&mut self) -> BoxFuture<'_, platform::Result<()>> {
        self.scrolls += 1;
        self.log.scrolls.fetch_add(1, Ordering::SeqCst);
        self.visible = (self.visible + self.script.step).min(self.script.feed.len());
        if let Some((n, cancel)) = &self.script.cancel_on_scroll
            && self.scrolls >= *n
        {
            cancel.cancel();
        }
        Box::pin(async { Ok(()) })
    }

    fn detect_error_banner(&mut self) -> BoxFuture<'_, platform::Result<Option<Banner>>> {
        let banner = self.banners.pop_front();
        Box::pin(async move { Ok(banner) })
    }

    fn trigger_retry_affordance(&mut self) -> BoxFuture<'_, platform::Result<bool>> {
        let found = self.script.retry_affordance;
        Box::pin(async move { Ok(found) })
    }
}

// --- Coordinators ---

pub fn api_coordinator(pools: Arc<IdentityPool>, api: &FakeApi) -> Coordinator {
    Coordinator::new(pools, EngineConfig::default())
        .with_api(Arc::new(api.clone()), Arc::new(NormalizedPageParser))
}

pub fn dom_coordinator(pools: Arc<IdentityPool>, launcher: FakeLauncher) -> (Coordinator, Arc<LaunchLog>) {
    let log = launcher.log.clone();
    let browsers = Arc::new(BrowserPool::new(Arc::new(launcher), 2));
    let coordinator = Coordinator::new(pools, EngineConfig::default()).with_browsers(browsers);
    (coordinator, log)
}
