//! # hookline: signed, retried webhook delivery
//!
//! `hookline` delivers domain events from a multi-tenant messaging platform (messages received,
//! sent, delivered, read; sessions connecting, disconnecting or showing a pairing QR code) to the
//! HTTP endpoints tenants register. Every delivery is an HMAC-SHA256 signed JSON `POST`; failures
//! are retried with exponential backoff, and endpoints that fail persistently are switched off by
//! a circuit breaker.
//!
//! ## Architecture
//!
//! Producers call [`EventDispatcher::trigger`](webhooks::EventDispatcher::trigger), which looks up
//! the owner's subscribed endpoints and pushes one attempt per match onto a bounded queue. It
//! never waits for delivery. A single worker task ([`webhooks::worker`]) wakes on a short tick,
//! moves new attempts into a due-time heap, re-checks each due attempt's endpoint, signs the body
//! and hands it to a semaphore-bounded pool of HTTP senders. Results flow back to the worker,
//! which updates the endpoint's counters, appends to the [delivery log](webhooks::delivery_log),
//! schedules retries and consults the [circuit breaker](webhooks::circuit_breaker).
//!
//! Tenants manage endpoints through the [`EndpointRegistry`](webhooks::EndpointRegistry), which
//! validates configuration, enforces per-plan quotas of active endpoints and sends a test ping
//! whenever an endpoint is created or re-targeted.
//!
//! Storage sits behind the traits in [`db::handlers`]. [`Application::new`] wires the engine to
//! in-memory stores; [`Application::with_stores`] accepts any other implementation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use hookline::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = hookline::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     hookline::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod telemetry;
pub mod types;
pub mod webhooks;

use std::sync::{Arc, OnceLock};

use axum::{
    Router,
    routing::{get, post},
};
use bon::Builder;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

pub use config::Config;

use crate::db::handlers::{EndpointStore, InMemoryEndpoints, InMemoryPlans, PlanStore};
use crate::webhooks::{EndpointRegistry, EventDispatcher, WebhookEngine};

/// Shared state handed to HTTP handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .registry(engine.registry().clone())
///     .dispatcher(engine.dispatcher().clone())
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub registry: EndpointRegistry,
    pub dispatcher: EventDispatcher,
    pub metrics_handle: Option<PrometheusHandle>,
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder on first use and return its handle.
///
/// If some other recorder was installed first, the handle still renders but stays empty.
pub fn get_or_install_prometheus_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                tracing::warn!("A global metrics recorder was already installed; Prometheus output will be empty");
            }
            handle
        })
        .clone()
}

/// Build the service router.
pub fn build_router(state: &AppState) -> Router {
    let mut router = Router::new().route("/healthz", get(|| async { "OK" }));

    if state.config.webhooks.test_receiver_secret.is_some() {
        router = router.route(
            "/webhooks/test-receiver",
            post(api::handlers::webhooks::test_receiver),
        );
    }

    if let Some(handle) = state.metrics_handle.clone() {
        router = router.route("/internal/metrics", get(|| async move { handle.render() }));
    }

    router.with_state(state.clone()).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Main application struct that owns the router and the delivery engine.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] starts the webhook engine's background tasks
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, the engine is stopped and telemetry
///    flushed
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    plans: Option<Arc<InMemoryPlans>>,
    engine: WebhookEngine,
}

impl Application {
    /// Create an application backed by in-memory stores.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let plans = Arc::new(InMemoryPlans::new());
        let mut app = Self::with_stores(config, Arc::new(InMemoryEndpoints::new()), plans.clone()).await?;
        app.plans = Some(plans);
        Ok(app)
    }

    /// Create an application on top of caller-provided stores.
    pub async fn with_stores(
        config: Config,
        store: Arc<dyn EndpointStore>,
        plans: Arc<dyn PlanStore>,
    ) -> anyhow::Result<Self> {
        debug!("Starting hookline with configuration: {:#?}", config);

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let engine = WebhookEngine::start(store, plans, &config.webhooks, shutdown_token)?;

        let app_state = AppState::builder()
            .config(config.clone())
            .registry(engine.registry().clone())
            .dispatcher(engine.dispatcher().clone())
            .maybe_metrics_handle(config.enable_metrics.then(get_or_install_prometheus_handle))
            .build();

        let router = build_router(&app_state);

        Ok(Self {
            router,
            app_state,
            config,
            plans: None,
            engine,
        })
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.app_state.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.app_state.dispatcher
    }

    pub fn engine(&self) -> &WebhookEngine {
        &self.engine
    }

    /// The in-memory plan store, when the application was built with [`Application::new`].
    pub fn plans(&self) -> Option<&Arc<InMemoryPlans>> {
        self.plans.as_ref()
    }

    /// A clone of the router, e.g. for `axum_test::TestServer`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "hookline listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Pending deliveries are dropped here
        self.engine.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use axum_test::TestServer;

    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_only_when_enabled() {
        let mut config = Config::default();
        config.enable_metrics = false;
        let app = Application::new(config).await.unwrap();
        let server = TestServer::new(app.router()).unwrap();
        server.get("/internal/metrics").await.assert_status_not_found();

        let mut config = Config::default();
        config.enable_metrics = true;
        let app = Application::new(config).await.unwrap();
        let server = TestServer::new(app.router()).unwrap();

        metrics::counter!("hookline_deliveries_enqueued_total").increment(1);
        let response = server.get("/internal/metrics").await;
        response.assert_status_ok();
        assert!(response.text().contains("hookline_deliveries_enqueued_total"));
    }

    #[tokio::test]
    async fn test_application_exposes_engine_handles() {
        let app = Application::new(Config::default()).await.unwrap();
        assert!(app.plans().is_some());

        let owner = uuid::Uuid::new_v4();
        let enqueued = app
            .dispatcher()
            .trigger(webhooks::EventName::MessageSent, serde_json::json!({}), owner, None)
            .await
            .unwrap();
        assert_eq!(enqueued, 0);
        assert!(app.registry().list_for_owner(owner, None).await.unwrap().is_empty());
    }
}
