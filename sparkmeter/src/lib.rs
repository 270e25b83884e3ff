//! Usage metering and billing reconciliation for AI request pipelines.
//!
//! The crate has two halves that deliberately do not share state:
//!
//! - **Live correlation** ([`correlator`]): an in-process listener that
//!   stitches model-run events into per-chain aggregates for observability.
//! - **Billing** ([`traces`], [`billing`], [`payment_providers`]): a
//!   pull-based pipeline that fetches finished traces from the telemetry
//!   source, converts them into spark billing units, and reports idempotent
//!   meter events to the payment provider.
//!
//! Billing always recomputes from the telemetry source, so a crashed or
//! restarted process never loses billable usage; the correlator's aggregates
//! are advisory metrics only.
//!
//! [`Application`] wires both halves to an axum HTTP surface plus the
//! background sweep and scheduled-sync tasks.

use anyhow::Context;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod metrics;
pub mod openapi;
pub mod payment_providers;
pub mod telemetry;
pub mod traces;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};

use billing::{BillingService, ConverterConfig};
use correlator::RunCorrelator;
use metrics::SparkMetrics;
use payment_providers::{PaymentProvider, create_provider};
use traces::{HttpTraceSource, UsageFetcher, http::TraceSourceSettings};

/// Shared state handed to every request handler.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub correlator: Arc<RunCorrelator>,
    pub metrics: Option<SparkMetrics>,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/usage/stats", get(api::handlers::usage::get_usage_stats))
        .route("/usage/sync", post(api::handlers::usage::sync_usage))
        .route("/subscriptions", post(api::handlers::subscriptions::create_subscription))
        .route(
            "/subscriptions/current",
            get(api::handlers::subscriptions::get_current_subscription),
        )
        .route("/subscriptions/{id}", put(api::handlers::subscriptions::update_subscription))
        .route(
            "/subscriptions/{id}",
            delete(api::handlers::subscriptions::cancel_subscription),
        )
        .route("/payment-methods", post(api::handlers::payments::attach_payment_method))
        .route("/invoices/upcoming", post(api::handlers::payments::get_upcoming_invoice))
        .route("/portal-sessions", post(api::handlers::payments::create_portal_session))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        // Webhook route (called by the payment provider, not part of client API docs)
        .route("/webhooks/payments", post(api::handlers::payments::webhook_handler))
        .with_state(state.clone())
        .merge(api_routes)
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()));

    if let Some(spark_metrics) = &state.metrics {
        let registry = spark_metrics.registry().clone();
        router = router.route(
            "/internal/metrics",
            get(move || async move {
                use prometheus::{Encoder, TextEncoder};

                let encoder = TextEncoder::new();
                let mut buffer = vec![];
                if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                    tracing::error!("Failed to encode metrics: {e}");
                }
                String::from_utf8(buffer).unwrap_or_default()
            }),
        );
    }

    let cors_layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors_layer).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Container for background tasks and their lifecycle management.
///
/// Holds the correlator TTL sweep and, when configured, the scheduled
/// billing sync. [`shutdown`](BackgroundServices::shutdown) cancels both and
/// waits for them to finish; the drop guard covers the case where the
/// container is dropped without an explicit shutdown.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    pub async fn shutdown(mut self) {
        info!("Shutting down background services...");
        self.shutdown_token.cancel();
        if let Some(guard) = self.drop_guard.take() {
            drop(guard);
        }
        for task in self.background_tasks {
            let _ = task.await;
        }
    }
}

fn setup_background_services(
    correlator: Arc<RunCorrelator>,
    billing: Arc<BillingService>,
    config: &Config,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> BackgroundServices {
    let mut background_tasks = Vec::new();

    // Correlator TTL sweep: evict entries whose end event never arrived.
    let sweep_correlator = correlator;
    let sweep_shutdown = shutdown_token.clone();
    let sweep_interval = config.correlator.sweep_interval;
    let max_run_age = config.correlator.max_run_age;
    background_tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    sweep_correlator.sweep(max_run_age);
                }
            }
        }
    }));

    // Scheduled billing sync. Meter-event idempotency makes overlapping or
    // repeated passes safe, so the loop just calls sync and moves on.
    if let Some(sync_interval) = config.billing.sync_interval {
        let sync_billing = billing;
        let sync_shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sync_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let result = sync_billing.sync_usage(None).await;
                        info!(
                            processed = result.processed_traces.len(),
                            failed = result.failed_traces.len(),
                            "scheduled usage sync pass finished"
                        );
                    }
                }
            }
        }));
    }

    let drop_guard = shutdown_token.clone().drop_guard();
    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] validates configuration, connects the
///    telemetry source and payment provider, and starts background services
/// 2. **Serve**: [`Application::serve`] binds a TCP port and handles
///    requests until the shutdown future resolves
pub struct Application {
    router: Router,
    config: Arc<Config>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let telemetry_source = config
            .telemetry_source
            .clone()
            .context("telemetry_source configuration is required")?;
        let payment = config.payment.clone().context("payment configuration is required")?;

        let source = HttpTraceSource::new(TraceSourceSettings {
            base_url: telemetry_source.url,
            public_key: telemetry_source.public_key,
            secret_key: telemetry_source.secret_key,
            request_timeout: telemetry_source.request_timeout,
        })?;
        let fetcher = UsageFetcher::new(Arc::new(source), telemetry_source.page_size);

        let provider: Arc<dyn PaymentProvider> = Arc::from(create_provider(payment));
        let billing = Arc::new(BillingService::new(
            fetcher,
            ConverterConfig {
                usd_to_sparks: config.billing.usd_to_sparks,
                default_customer_id: config.billing.default_customer_id.clone(),
            },
            provider,
            config.billing.meter.clone(),
        ));

        let spark_metrics = if config.enable_metrics {
            Some(SparkMetrics::new(&prometheus::Registry::new())?)
        } else {
            None
        };
        let run_correlator = Arc::new(RunCorrelator::new(spark_metrics.clone()));

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(
            run_correlator.clone(),
            billing.clone(),
            &config,
            shutdown_token,
        );

        let config = Arc::new(config);
        let state = AppState::builder()
            .config(config.clone())
            .billing(billing)
            .correlator(run_correlator)
            .maybe_metrics(spark_metrics)
            .build();

        Ok(Self {
            router: build_router(state),
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server =
            axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Spark metering layer listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;
        Ok(())
    }
}
