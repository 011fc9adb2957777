//! # trigctl: Webhook Trigger Engine for Vehicle Telemetry
//!
//! `trigctl` ingests two streams of per-vehicle messages from a partitioned
//! message bus - time-series *signals* (speed, battery level, location) and
//! discrete *events* (harsh braking, trips) - and fans each message out to
//! user-defined HTTPS webhooks whose conditions evaluate true on that
//! message. Conditions are boolean expressions in a small sandboxed
//! language, typically referring to both the current sample and the
//! previous sample that fired the same webhook.
//!
//! ## Architecture
//!
//! The hot path is: bus message -> decode -> vehicle DID + metric ->
//! [`index`] lookup -> per-webhook [`evaluate`] (permission, cooldown,
//! previous values, condition) -> [`dispatch`] (CloudEvents POST with
//! circuit breaking) -> acknowledge. PostgreSQL ([`db`], [`store`]) backs
//! the webhook definitions, vehicle subscriptions, and the per-(webhook,
//! vehicle) fire log that anchors cooldowns and previous-value lookups.
//!
//! The [`index`] is the only runtime global: an immutable snapshot behind
//! an atomic pointer, rebuilt on a debounced schedule whenever the CRUD
//! surface ([`api`]) or a permission revocation changes what should be
//! indexed, and unconditionally on a background interval.
//!
//! Everything runs under one root cancellation token: the consumer loops
//! ([`consumer`]), the index refresher, in-flight webhook fan-outs, and
//! condition evaluation itself (the expression runtime polls the token, so
//! a runaway condition cannot stall draining).

pub mod api;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod evaluate;
pub mod index;
pub mod oracle;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod xl;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod test;

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, instrument, warn};

use crate::catalog::SignalCatalog;
use crate::consumer::{ConsumerLoop, TriggerEngine};
use crate::dispatch::Dispatcher;
use crate::evaluate::Evaluator;
use crate::index::TriggerIndex;
use crate::index::refresh::{RefreshHandle, refresh_channel, run_refresher};
use crate::oracle::{PermissionOracle, TokenExchangeOracle};
use crate::store::{PgTriggerStore, TriggerStore};
use crate::types::Service;

pub use config::Config;

/// Timeout for the target-URI verification handshake.
const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub catalog: Arc<SignalCatalog>,
    pub refresh: RefreshHandle,
    /// Client used for the webhook verification handshake.
    pub http_client: reqwest::Client,
}

/// Build the HTTP router: health plus the webhook management surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route(
            "/v1/webhooks",
            get(api::handlers::webhooks::list_webhooks).post(api::handlers::webhooks::create_webhook),
        )
        .route(
            "/v1/webhooks/{webhook_id}",
            get(api::handlers::webhooks::get_webhook)
                .patch(api::handlers::webhooks::update_webhook)
                .delete(api::handlers::webhooks::delete_webhook),
        )
        .route(
            "/v1/webhooks/{webhook_id}/subscriptions",
            get(api::handlers::webhooks::list_subscriptions),
        )
        .route(
            "/v1/webhooks/{webhook_id}/subscriptions/{asset_did}",
            post(api::handlers::webhooks::create_subscription)
                .delete(api::handlers::webhooks::delete_subscription),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

/// Container for background tasks and their lifecycle.
///
/// Holds the index refresher and the two consumer loops in a `JoinSet`;
/// the `drop_guard` cancels the shutdown token if the container is dropped
/// without an orderly shutdown.
pub struct BackgroundServices {
    background_tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    task_names: HashMap<tokio::task::Id, &'static str>,
    shutdown_token: tokio_util::sync::CancellationToken,
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Wait for any background task to exit (which indicates a failure).
    /// Cancel-safe; usable inside `tokio::select!` without losing tasks.
    pub async fn wait_for_failure(&mut self) -> anyhow::Result<std::convert::Infallible> {
        match self.background_tasks.join_next_with_id().await {
            None => {
                // No background tasks - wait forever.
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Ok((task_id, Ok(())))) => {
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::warn!(task = task_name, "Background task completed unexpectedly");
                anyhow::bail!("Background task '{}' completed early", task_name)
            }
            Some(Ok((task_id, Err(e)))) => {
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::error!(task = task_name, error = %e, "Background task failed");
                anyhow::bail!("Background task '{}' failed: {}", task_name, e)
            }
            Some(Err(e)) => {
                let task_id = e.id();
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::error!(task = task_name, error = %e, "Background task panicked");
                anyhow::bail!("Background task '{}' panicked: {}", task_name, e)
            }
        }
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();

        while let Some(result) = self.background_tasks.join_next_with_id().await {
            match result {
                Ok((task_id, Ok(()))) => {
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::debug!(task = task_name, "Background task completed");
                }
                Ok((task_id, Err(e))) => {
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::error!(task = task_name, error = %e, "Background task failed");
                }
                Err(e) => {
                    let task_id = e.id();
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::error!(task = task_name, error = %e, "Background task panicked");
                }
            }
        }
    }
}

/// Helper for spawning named background tasks during setup
struct BackgroundTaskBuilder {
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    names: HashMap<tokio::task::Id, &'static str>,
}

impl BackgroundTaskBuilder {
    fn new() -> Self {
        Self {
            tasks: tokio::task::JoinSet::new(),
            names: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let abort_handle = self.tasks.spawn(future);
        self.names.insert(abort_handle.id(), name);
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] connects the database, runs
///    migrations, loads the signal catalog, builds the index, and spawns
///    the background services.
/// 2. **Serve**: [`Application::serve`] binds the HTTP listener and runs
///    until the provided shutdown future resolves or a background task
///    dies.
pub struct Application {
    router: Router,
    config: Config,
    background: BackgroundServices,
}

impl Application {
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config.database).await?;
        db::migrator().run(&pool).await?;

        // The catalog is process-wide and read-only; failing to load it is
        // fatal because conditions cannot be type-checked without it.
        let catalog = Arc::new(SignalCatalog::load_embedded()?);
        info!(signals = catalog.len(), "Signal catalog loaded");

        let store: Arc<dyn TriggerStore> = Arc::new(PgTriggerStore::new(pool.clone()));
        let oracle: Arc<dyn PermissionOracle> = Arc::new(TokenExchangeOracle::new(
            config.permissions.token_exchange_url.clone(),
            config.permissions.request_timeout,
        )?);

        let index = Arc::new(TriggerIndex::new(store.clone(), catalog.clone()));
        if let Err(e) = index.rebuild().await {
            // Start with an empty index; the refresher keeps retrying.
            warn!(error = %e, "Initial index build failed");
        }

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let mut tasks = BackgroundTaskBuilder::new();

        let (refresh, refresh_rx) = refresh_channel();
        {
            let index = index.clone();
            let debounce = config.engine.cache_refresh_debounce;
            let interval = config.engine.cache_refresh_interval;
            let token = shutdown_token.clone();
            tasks.spawn("index-refresher", async move {
                run_refresher(index, refresh_rx, debounce, interval, token).await;
                Ok(())
            });
        }

        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            oracle,
            catalog.clone(),
            config.engine.xl_cost_limit,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            catalog.clone(),
            config.engine.http_dispatch_timeout,
            config.engine.max_failure_count,
            config.engine.delivery_source.clone(),
        )?);
        let engine = Arc::new(TriggerEngine::new(
            index,
            evaluator,
            dispatcher,
            store,
            refresh.clone(),
            config.engine.dispatch_concurrency,
        ));

        if config.nats.enabled {
            let client = async_nats::connect(&config.nats.url).await?;
            let jetstream = async_nats::jetstream::new(client);

            let loops = [
                (
                    Service::Signals,
                    "signals-consumer",
                    config.nats.signals_stream.clone(),
                    config.nats.signals_subject.clone(),
                ),
                (
                    Service::Events,
                    "events-consumer",
                    config.nats.events_stream.clone(),
                    config.nats.events_subject.clone(),
                ),
            ];
            for (service, task_name, stream_name, subject) in loops {
                let consumer_loop = ConsumerLoop::new(
                    service,
                    engine.clone(),
                    jetstream.clone(),
                    stream_name,
                    subject,
                    format!("{}-{}", config.nats.consumer_group, service),
                    config.nats.initial_offset,
                    config.engine.handler_deadline,
                );
                let token = shutdown_token.clone();
                tasks.spawn(task_name, consumer_loop.run(token));
            }
        } else {
            info!("Bus consumer loops disabled by configuration");
        }

        let http_client = reqwest::Client::builder()
            .timeout(VERIFICATION_TIMEOUT)
            .build()?;
        let state = AppState {
            db: pool,
            config: config.clone(),
            catalog,
            refresh,
            http_client,
        };
        let router = build_router(state);

        let BackgroundTaskBuilder { tasks, names } = tasks;
        Ok(Self {
            router,
            config,
            background: BackgroundServices {
                background_tasks: tasks,
                task_names: names,
                shutdown_token,
                drop_guard: Some(drop_guard),
            },
        })
    }

    /// Serve until the shutdown future resolves or a background task dies,
    /// then drain everything gracefully.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Application {
            router,
            config,
            mut background,
        } = self;

        let listener = TcpListener::bind(config.bind_address()).await?;
        info!(address = %config.bind_address(), "HTTP server listening");

        let root_token = background.shutdown_token.clone();
        let graceful = root_token.clone();
        let server = tokio::spawn(
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .into_future(),
        );

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received, draining");
            }
            result = background.wait_for_failure() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Background task failure, shutting down");
                }
            }
        }

        root_token.cancel();
        background.shutdown().await;
        server.await??;
        Ok(())
    }
}
