//! HTTP gateway: routes, shared state and the serve loop.

pub mod api;
pub mod rate_limit;
pub mod sse;

use anyhow::{Context, Result};
use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::{create_verifier, TokenVerifier};
use crate::chat::ChatService;
use crate::config::{Config, GatewayConfig, StreamConfig};
use crate::demo::{DemoRegistry, DemoService, DemoSweeper};
use crate::infra::{
    create_ingestion_worker, spawn_job, FlushScheduler, PeriodicJob, StaleKeyReaper,
};
use crate::observability::Metrics;
use crate::providers::{create_chat_model, create_retriever};
use crate::relay::RelayHub;
use crate::sessions::{Clock, SessionCoordinator, SystemClock};
use crate::storage::{create_durable_store, create_fast_store};

pub use rate_limit::RateLimiter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub demo: DemoService,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Metrics,
    pub limiter: Arc<RateLimiter>,
    pub stream: StreamConfig,
    pub admin_token: Option<String>,
    pub trust_forwarded_headers: bool,
    /// Whether queued PDF tasks have a consumer; `/upsert_pdf` refuses work otherwise.
    pub ingestion_enabled: bool,
}

impl AppState {
    pub fn new(
        chat: ChatService,
        demo: DemoService,
        verifier: Arc<dyn TokenVerifier>,
        metrics: Metrics,
        config: &Config,
    ) -> Self {
        let gateway = &config.gateway;
        Self {
            chat,
            demo,
            verifier,
            metrics,
            limiter: Arc::new(RateLimiter::new(
                gateway.rate_limit_per_minute,
                gateway.rate_limit_max_keys,
            )),
            stream: config.stream.clone(),
            admin_token: gateway.admin_token.clone().filter(|t| !t.is_empty()),
            trust_forwarded_headers: gateway.trust_forwarded_headers,
            ingestion_enabled: config.ingestion.endpoint().is_some(),
        }
    }
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the router. Limited routes sit behind the per-client rate limiter;
/// health and metrics do not.
pub fn build_router(state: AppState, config: &GatewayConfig) -> Router {
    let limited = Router::new()
        .route("/chat_send", post(api::handle_chat_send))
        .route("/chat_stream/{id}", get(api::handle_chat_stream))
        .route("/sessions/{id}/history", get(api::handle_history))
        .route("/sessions/{id}/title", put(api::handle_title))
        .route("/admin/sessions/{id}", delete(api::handle_admin_clear))
        .route("/upsert_pdf", post(api::handle_upsert_pdf))
        .route("/demo_chat_send", post(api::handle_demo_send))
        .route("/demo_chat_stream/{id}", get(api::handle_demo_stream))
        .route_layer(from_fn_with_state(state.clone(), rate_limit::rate_limit));

    Router::new()
        .route("/health", get(api::handle_health))
        .route("/metrics", get(api::handle_metrics))
        .merge(limited)
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(cors_layer(config))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Wire every component, start the periodic jobs and serve until a shutdown
/// signal. Pending fast-tier sessions are flushed before returning.
pub async fn run_gateway(config: Config) -> Result<()> {
    let metrics = Metrics::new()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let fast = create_fast_store();
    let durable = create_durable_store(&config).await?;
    tracing::info!(fast = fast.name(), durable = durable.name(), "Session stores ready");

    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::clone(&fast),
        durable,
        Arc::clone(&clock),
    ));
    let model = create_chat_model(&config.provider);
    let retriever = create_retriever();

    let chat = ChatService::new(
        Arc::clone(&coordinator),
        RelayHub::with_metrics(metrics.clone()),
        Arc::clone(&model),
        Arc::clone(&retriever),
        &config,
    )
    .with_metrics(metrics.clone());
    let registry = Arc::new(DemoRegistry::new(Arc::clone(&clock)));
    let demo = DemoService::new(Arc::clone(&registry), model, retriever, &config);

    let flusher = Arc::new(FlushScheduler::new(
        Arc::clone(&coordinator),
        &config.sessions,
        metrics.clone(),
    ));
    let mut jobs: Vec<Arc<dyn PeriodicJob>> = vec![
        Arc::clone(&flusher) as Arc<dyn PeriodicJob>,
        Arc::new(StaleKeyReaper::new(
            Arc::clone(&fast),
            clock,
            &config.sessions,
            metrics.clone(),
        )),
        Arc::new(DemoSweeper::new(registry, &config.demo)),
    ];
    match create_ingestion_worker(&config.ingestion, fast, metrics.clone()) {
        Some(worker) => jobs.push(Arc::new(worker)),
        None => tracing::warn!("No ingestion endpoint configured; /upsert_pdf is disabled"),
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| spawn_job(job, shutdown_rx.clone()))
        .collect();

    let state = AppState::new(chat, demo, create_verifier(&config.auth), metrics, &config);
    let app = build_router(state, &config.gateway);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

    let mut grace = shutdown_rx.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Idle stream clients would otherwise hold graceful shutdown open forever.
    let served = tokio::select! {
        result = server.into_future() => result,
        () = async {
            let _ = grace.wait_for(|stopping| *stopping).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Open connections did not close in time");
            Ok(())
        }
    };

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Periodic job ended abnormally");
        }
    }
    match flusher.drain().await {
        Ok(report) => tracing::info!(
            flushed = report.acted,
            failed = report.failed,
            "Pending sessions flushed on shutdown"
        ),
        Err(e) => tracing::error!(error = %e, "Shutdown flush failed"),
    }

    served.context("gateway server error")
}
