//! Harvest daemon
//!
//! Hosts the shared identity pools of the acquisition engine:
//! 1. Loads credentials and the proxy list into the session and egress pools
//! 2. Validates the engine thresholds and connects the rate governor store
//! 3. Serves pool and governor health, the effective engine thresholds,
//!    session recovery and Prometheus metrics on the admin listener until
//!    SIGTERM/SIGINT

mod admin;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acquisition::config::EngineConfig;
use acquisition::governor::RateGovernor;
use credentials::{CredentialStore, ProxyList};
use identity_pool::{EgressPool, IdentityPool, SessionPool};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// How long in-flight admin requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pools: Arc<IdentityPool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
    governor: Option<Arc<RateGovernor>>,
    engine: Arc<EngineConfig>,
}

fn build_router(state: AppState, max_connections: usize) -> Router {
    let admin = build_admin_router(AdminState::new(state.pools.clone()));
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/engine", get(engine_handler))
        .with_state(state)
        .merge(admin)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting harvestd");

    // Before any metric is emitted
    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        credentials = %config.sources.credentials_path.display(),
        proxies = config
            .sources
            .proxies_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "direct".into()),
        max_distinct_sessions = config.engine.api.max_distinct_sessions,
        governor_max_requests = config.governor.max_requests,
        "configuration loaded"
    );

    let store = CredentialStore::load(config.sources.credentials_path.clone())
        .await
        .context("failed to load credential store")?;
    let sessions = SessionPool::initialize(&store, config.pool.session_failure_threshold)
        .await
        .context("session pool has no usable credentials")?;
    let egress = EgressPool::initialize(
        &ProxyList::new(config.sources.proxies_path.clone()),
        &config.pool,
    )
    .await
    .context("failed to load proxy list")?;
    let pools = Arc::new(IdentityPool::new(Arc::new(sessions), Arc::new(egress)));

    let governor = acquisition::governor::from_config(&config.governor)
        .await
        .map(Arc::new);
    match &governor {
        Some(governor) => {
            let health = governor.health().await;
            info!(
                store = health.store,
                reachable = health.reachable,
                max_requests = health.max_requests,
                window_secs = health.window_secs,
                "rate governor ready"
            );
        }
        None => warn!("rate governor disabled, requests are not budgeted across workers"),
    }

    let app_state = AppState {
        pools,
        prometheus,
        started_at: Instant::now(),
        governor,
        engine: Arc::new(config.engine),
    };
    let app = build_router(app_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "admin listener ready");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("admin requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// 200 while at least one session is active, 503 once every session is retired.
/// An unreachable governor store only shows in the body; the governor fails open.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pools = state.pools.health().await;
    let governor = match &state.governor {
        Some(governor) => serde_json::to_value(governor.health().await)
            .unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    };
    let sessions_status = pools["sessions"]["status"].as_str().unwrap_or("unhealthy");

    let (status_code, status) = match sessions_status {
        "healthy" => (StatusCode::OK, "healthy"),
        "degraded" => (StatusCode::OK, "degraded"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "governor_enabled": state.governor.is_some(),
        "governor": governor,
        "sessions": {
            "status": sessions_status,
            "active": pools["sessions"]["sessions_active"],
            "total": pools["sessions"]["sessions_total"],
        },
        "egress": {
            "status": pools["egress"]["status"],
            "healthy": pools["egress"]["endpoints_healthy"],
            "total": pools["egress"]["endpoints_total"],
        },
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Effective engine thresholds after defaults are applied.
async fn engine_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.engine.as_ref().clone())
}

/// Prometheus text exposition, with pool gauges refreshed first.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::record_pool_health(&state.pools.health().await);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use acquisition::config::GovernorConfig;
    use acquisition::governor::MemoryCounterStore;
    use axum::http::Request;
    use common::Secret;
    use identity_pool::PoolConfig;
    use platform::{CredentialBundle, EgressRoute, SessionSeed};
    use tower::ServiceExt;

    /// A handle without installing the global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_app_state(session_ids: &[&str], routes: Vec<EgressRoute>) -> AppState {
        let seeds = session_ids
            .iter()
            .map(|id| SessionSeed {
                id: id.to_string(),
                identity: format!("user_{id}"),
                credentials: CredentialBundle {
                    auth_token: Secret::new(format!("tok_{id}")),
                    csrf_token: None,
                },
            })
            .collect();
        let config = PoolConfig::default();
        let sessions = SessionPool::from_seeds(seeds, config.session_failure_threshold).unwrap();
        let egress = EgressPool::new(routes, &config);
        AppState {
            pools: Arc::new(IdentityPool::new(Arc::new(sessions), Arc::new(egress))),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
            governor: Some(Arc::new(RateGovernor::new(
                Arc::new(MemoryCounterStore::new()),
                &GovernorConfig::default(),
            ))),
            engine: Arc::new(EngineConfig::default()),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_pools() {
        let app = build_router(test_app_state(&["a", "b"], Vec::new()), 8);

        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"]["active"], 2);
        assert_eq!(json["egress"]["total"], 0);
        assert_eq!(json["governor_enabled"], true);
        assert_eq!(json["governor"]["store"], "memory");
        assert_eq!(json["governor"]["reachable"], true);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_without_governor_reports_null() {
        let mut state = test_app_state(&["a"], Vec::new());
        state.governor = None;
        let app = build_router(state, 8);

        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["governor_enabled"], false);
        assert!(json["governor"].is_null());
    }

    #[tokio::test]
    async fn engine_route_serves_effective_thresholds() {
        let mut state = test_app_state(&["a"], Vec::new());
        let mut engine = EngineConfig::default();
        engine.api.max_distinct_sessions = 7;
        state.engine = Arc::new(engine);
        let app = build_router(state, 8);

        let (status, json) = get_json(app, "/engine").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["api"]["max_distinct_sessions"], 7);
        assert_eq!(
            json["dom"]["deep_scroll_burst"],
            acquisition::config::DEFAULT_DEEP_SCROLL_BURST
        );
    }

    #[tokio::test]
    async fn health_degrades_then_fails_as_sessions_retire() {
        let state = test_app_state(&["a", "b"], Vec::new());
        let pools = state.pools.clone();
        let app = build_router(state, 8);
        let threshold = PoolConfig::default().session_failure_threshold;

        for _ in 0..threshold {
            pools.sessions().mark_bad("a").await;
        }
        let (status, json) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");

        for _ in 0..threshold {
            pools.sessions().mark_bad("b").await;
        }
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_exposition() {
        let app = build_router(test_app_state(&["a"], Vec::new()), 8);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn admin_routes_are_mounted() {
        let app = build_router(test_app_state(&["a"], Vec::new()), 8);

        let (status, json) = get_json(app, "/admin/pools").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessions"]["sessions_total"], 1);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(test_app_state(&["a"], Vec::new()), 8);

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
