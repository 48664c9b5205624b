//! Egress pool: sticky session-to-endpoint binding with cooldown
//!
//! An endpoint that fails `failure_threshold` times in a row becomes unhealthy
//! and records a cooldown deadline. It is revived lazily: the first selection
//! strictly after the deadline marks it healthy again. An empty pool is valid
//! and means requests go out directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use platform::EgressRoute;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::PoolConfig;
use crate::error::{Error, Result};
use crate::source::EgressSource;

/// The newest response-time sample carries 1/EWMA_WEIGHT of the average.
const EWMA_WEIGHT: u32 = 5;

#[derive(Debug)]
struct EndpointState {
    route: EgressRoute,
    healthy: bool,
    consecutive_failures: u32,
    failure_count: u64,
    success_count: u64,
    cooldown_until: Option<Instant>,
    bound_session: Option<String>,
    avg_response: Option<Duration>,
}

impl EndpointState {
    fn new(route: EgressRoute) -> Self {
        Self {
            route,
            healthy: true,
            consecutive_failures: 0,
            failure_count: 0,
            success_count: 0,
            cooldown_until: None,
            bound_session: None,
            avg_response: None,
        }
    }

    /// Whether the endpoint may be selected now, reviving it if its cooldown
    /// has strictly elapsed.
    fn selectable(&mut self, now: Instant) -> bool {
        if self.healthy {
            return true;
        }
        match self.cooldown_until {
            Some(until) if now > until => {
                info!(egress = %self.route.key(), "egress cooldown elapsed, endpoint healthy again");
                self.healthy = true;
                self.consecutive_failures = 0;
                self.cooldown_until = None;
                true
            }
            _ => false,
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Higher success rate wins; equal rates go to the lower average response
    /// time. Unmeasured latency ranks last.
    fn outranks(&self, other: &EndpointState) -> bool {
        let (mine, theirs) = (self.success_rate(), other.success_rate());
        mine > theirs
            || (mine == theirs
                && self.avg_response.unwrap_or(Duration::MAX)
                    < other.avg_response.unwrap_or(Duration::MAX))
    }

    fn selected(&self) -> SelectedEgress {
        SelectedEgress {
            key: self.route.key(),
            route: self.route.clone(),
        }
    }
}

/// An endpoint handed out by the pool.
#[derive(Debug, Clone)]
pub struct SelectedEgress {
    pub key: String,
    pub route: EgressRoute,
}

pub struct EgressPool {
    endpoints: RwLock<Vec<EndpointState>>,
    len: usize,
    next_index: AtomicUsize,
    cooldown: Duration,
    failure_threshold: u32,
}

impl EgressPool {
    pub fn new(routes: Vec<EgressRoute>, config: &PoolConfig) -> Self {
        let mut endpoints: Vec<EndpointState> = Vec::with_capacity(routes.len());
        for route in routes {
            if endpoints.iter().any(|e| e.route.key() == route.key()) {
                warn!(egress = %route.key(), "duplicate egress endpoint ignored");
                continue;
            }
            endpoints.push(EndpointState::new(route));
        }
        if endpoints.is_empty() {
            info!("egress pool empty, requests go out directly");
        } else {
            info!(endpoints = endpoints.len(), "egress pool initialized");
        }
        Self {
            len: endpoints.len(),
            endpoints: RwLock::new(endpoints),
            next_index: AtomicUsize::new(0),
            cooldown: config.egress_cooldown(),
            failure_threshold: config.egress_failure_threshold.max(1),
        }
    }

    pub async fn initialize(source: &dyn EgressSource, config: &PoolConfig) -> Result<Self> {
        let routes = source.load_routes().await?;
        Ok(Self::new(routes, config))
    }

    /// An empty pool binds every session to the direct path.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Bind `session_id` to an endpoint, reusing its current binding when the
    /// bound endpoint is still selectable. A new binding takes the best-ranked
    /// free endpoint; the scan starts at a rotating offset so equally ranked
    /// endpoints take turns.
    ///
    /// Returns `Ok(None)` for an empty pool and `EgressExhausted` when every
    /// endpoint is cooling down.
    pub async fn bind(&self, session_id: &str) -> Result<Option<SelectedEgress>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut endpoints = self.endpoints.write().await;
        let now = Instant::now();

        if let Some(idx) = endpoints
            .iter()
            .position(|e| e.bound_session.as_deref() == Some(session_id))
        {
            if endpoints[idx].selectable(now) {
                return Ok(Some(endpoints[idx].selected()));
            }
            debug!(session_id, egress = %endpoints[idx].route.key(), "bound endpoint unavailable, rebinding");
            endpoints[idx].bound_session = None;
        }

        let n = endpoints.len();
        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;

        // Prefer endpoints no other session holds; share only when none are free.
        let mut free: Option<usize> = None;
        let mut shared: Option<usize> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if !endpoints[idx].selectable(now) {
                continue;
            }
            let slot = if endpoints[idx].bound_session.is_none() {
                &mut free
            } else {
                &mut shared
            };
            if slot.is_none_or(|b| endpoints[idx].outranks(&endpoints[b])) {
                *slot = Some(idx);
            }
        }
        if let Some(idx) = free {
            endpoints[idx].bound_session = Some(session_id.to_string());
            return Ok(Some(endpoints[idx].selected()));
        }
        if let Some(idx) = shared {
            debug!(session_id, egress = %endpoints[idx].route.key(), "sharing bound egress endpoint");
            return Ok(Some(endpoints[idx].selected()));
        }

        Err(Error::EgressExhausted(exhausted_message(&endpoints, now)))
    }

    /// Drop any binding held by `session_id`.
    pub async fn release(&self, session_id: &str) {
        let mut endpoints = self.endpoints.write().await;
        for endpoint in endpoints.iter_mut() {
            if endpoint.bound_session.as_deref() == Some(session_id) {
                endpoint.bound_session = None;
            }
        }
    }

    /// Record a success, folding `response_time` into the moving average.
    pub async fn mark_good(&self, key: &str, response_time: Option<Duration>) {
        let mut endpoints = self.endpoints.write().await;
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.route.key() == key) else {
            return;
        };
        endpoint.success_count += 1;
        endpoint.consecutive_failures = 0;
        if let Some(sample) = response_time {
            endpoint.avg_response = Some(match endpoint.avg_response {
                Some(avg) => (avg * (EWMA_WEIGHT - 1) + sample) / EWMA_WEIGHT,
                None => sample,
            });
        }
    }

    pub async fn mark_bad(&self, key: &str) {
        let mut endpoints = self.endpoints.write().await;
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.route.key() == key) else {
            return;
        };
        endpoint.failure_count += 1;
        endpoint.consecutive_failures += 1;
        if endpoint.healthy && endpoint.consecutive_failures >= self.failure_threshold {
            endpoint.healthy = false;
            endpoint.cooldown_until = Some(Instant::now() + self.cooldown);
            warn!(
                egress = key,
                cooldown_secs = self.cooldown.as_secs(),
                "egress endpoint entering cooldown"
            );
        }
    }

    /// Selectable endpoint with the best success rate, ties broken by the
    /// lower average response time.
    pub async fn best(&self) -> Option<SelectedEgress> {
        let mut endpoints = self.endpoints.write().await;
        let now = Instant::now();
        let mut best: Option<usize> = None;
        for idx in 0..endpoints.len() {
            if !endpoints[idx].selectable(now) {
                continue;
            }
            if best.is_none_or(|b| endpoints[idx].outranks(&endpoints[b])) {
                best = Some(idx);
            }
        }
        best.map(|idx| endpoints[idx].selected())
    }

    pub async fn health(&self) -> serde_json::Value {
        let endpoints = self.endpoints.read().await;
        let now = Instant::now();
        let mut healthy = 0usize;

        let entries: Vec<_> = endpoints
            .iter()
            .map(|e| {
                let remaining = e
                    .cooldown_until
                    .filter(|_| !e.healthy)
                    .map(|until| until.saturating_duration_since(now).as_secs())
                    .unwrap_or(0);
                if e.healthy || remaining == 0 {
                    healthy += 1;
                }
                serde_json::json!({
                    "endpoint": e.route.key(),
                    "status": if e.healthy { "healthy" } else { "cooling_down" },
                    "cooldown_remaining_secs": remaining,
                    "success_count": e.success_count,
                    "failure_count": e.failure_count,
                    "success_rate": e.success_rate(),
                    "avg_response_ms": e.avg_response.map(|d| d.as_millis() as u64),
                    "bound_session": e.bound_session,
                })
            })
            .collect();

        let total = endpoints.len();
        let status = if healthy == total {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "endpoints_total": total,
            "endpoints_healthy": healthy,
            "direct": total == 0,
            "endpoints": entries,
        })
    }
}

fn exhausted_message(endpoints: &[EndpointState], now: Instant) -> String {
    let retry_in = endpoints
        .iter()
        .filter_map(|e| e.cooldown_until)
        .map(|until| until.saturating_duration_since(now).as_secs())
        .min()
        .unwrap_or(0);
    serde_json::json!({
        "error": {
            "type": "egress_exhausted",
            "message": "All egress endpoints cooling down",
            "endpoints_total": endpoints.len(),
            "retry_in_secs": retry_in,
        }
    })
    .to_string()
}
