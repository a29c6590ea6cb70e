//! # ledgerctl: Compute Credit Ledger
//!
//! `ledgerctl` meters paid AI usage against prepaid credit balances. Every billable attempt is
//! priced up front, the estimate is frozen out of the user's balance, the work runs, and the hold
//! is then settled against actual token usage or refunded. Users top up through recharge orders
//! confirmed by payment gateway callbacks, and operators can grant or deduct credits with every
//! change written to an audit log.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer. Ledger
//! state lives in PostgreSQL in production, or in process-local tables for development and tests;
//! both backends implement the traits in [`storage`].
//!
//! ### Core Components
//!
//! The **billing layer** ([`billing`]) holds the cost formulas, the optimistic balance update
//! loop, the freeze ledger and the charge flow. Balance rows carry a version; every mutation is a
//! conditional write retried with jittered backoff, and ledger rows move in the same atomic write
//! as the balance they affect.
//!
//! The **recharge layer** ([`recharge`]) creates payment orders and applies gateway callbacks
//! exactly once, however often they are redelivered.
//!
//! The **audit layer** ([`audit`]) applies operator adjustments and keeps the append-only log.
//!
//! The **API layer** ([`api`]) is a thin HTTP surface over those services: the gateway webhook at
//! `/webhooks/payments` and the management API at `/admin/api/v1/*`.
//!
//! **Background services** run alongside the HTTP server: a reconciler that finishes records left
//! `frozen` by crashed or abandoned charges, and a sweeper that cancels expired recharge orders.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use ledgerctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = ledgerctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     ledgerctl::telemetry::init_telemetry(config.enable_otel_export, config.log_format)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Embedding
//!
//! Services that run the billed work themselves build an [`AppState`] over their storage and call
//! [`billing::UsageBillingService::charge`] around each unit of work.
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod audit;
pub mod billing;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod recharge;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

use crate::api::handlers::{audit_log, balances, freeze_records, payments, recharge_orders, system};
use crate::audit::{AdminAuditLog, BalanceAdjustments};
use crate::billing::{
    BalanceStore, FreezeLedger, FreezeReconciler, NoUsageLookup, UsageBillingService, UsageLookup,
};
use crate::config::{DatabaseConfig, PoolSettings};
use crate::recharge::RechargeOrderService;
use crate::recharge::signing::CallbackVerifier;
use crate::storage::{Storage, in_memory::InMemoryStorage, postgres::PostgresStorage};

pub use config::Config;

/// Services shared by every request handler and background task.
#[derive(Builder)]
pub struct AppState<S> {
    pub balances: BalanceStore<S>,
    pub billing: UsageBillingService<S>,
    pub recharge: RechargeOrderService<S>,
    pub adjustments: BalanceAdjustments<S>,
    pub audit_log: AdminAuditLog<S>,
    pub config: Config,
    /// Set when `recharge.callback_secret` is configured; unsigned callbacks are then refused
    pub callback_verifier: Option<CallbackVerifier>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            balances: self.balances.clone(),
            billing: self.billing.clone(),
            recharge: self.recharge.clone(),
            adjustments: self.adjustments.clone(),
            audit_log: self.audit_log.clone(),
            config: self.config.clone(),
            callback_verifier: self.callback_verifier.clone(),
        }
    }
}

impl<S: Storage> AppState<S> {
    /// Wire every service over one storage backend
    pub fn new(storage: Arc<S>, config: Config) -> Self {
        let balances = BalanceStore::new(storage.clone(), config.billing.retry.clone());
        let billing = UsageBillingService::new(
            balances.clone(),
            FreezeLedger::new(storage.clone()),
            Arc::new(config.pricing_catalog()),
        )
        .with_work_timeout(config.billing.work_timeout);
        let recharge = RechargeOrderService::new(storage.clone(), balances.clone(), config.recharge.clone());
        let callback_verifier = config
            .recharge
            .callback_secret
            .as_ref()
            .map(|secret| CallbackVerifier::new(secret.clone(), config.recharge.callback_tolerance));

        Self::builder()
            .adjustments(BalanceAdjustments::new(storage.clone(), balances.clone()))
            .audit_log(AdminAuditLog::new(storage))
            .balances(balances)
            .billing(billing)
            .recharge(recharge)
            .maybe_callback_verifier(callback_verifier)
            .config(config)
            .build()
    }
}

/// Get the ledgerctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the HTTP router over `state`.
pub fn build_router<S: Storage>(state: AppState<S>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/users/{user_id}/balance",
            get(balances::get_balance::<S>).post(balances::open_account::<S>),
        )
        .route("/users/{user_id}/balance/adjustments", post(balances::create_adjustment::<S>))
        .route("/freeze-records/{request_id}", get(freeze_records::get_freeze_record::<S>))
        .route("/recharge-orders", post(recharge_orders::create_order::<S>))
        .route("/recharge-orders/{order_id}", get(recharge_orders::get_order::<S>))
        .route("/audit-log", get(audit_log::list_audit_log::<S>))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(system::healthz))
        .route("/webhooks/payments", post(payments::payment_callback::<S>))
        .with_state(state.clone())
        .nest("/admin/api/v1", admin_routes);

    if state.config.enable_metrics {
        router = router.route("/internal/metrics", get(system::metrics));
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Background tasks running alongside the HTTP server:
/// - Freeze reconciliation (when `reconciliation.enabled`)
/// - Recharge order expiry sweep (when `recharge.sweeper_enabled`)
///
/// [`shutdown`](BackgroundServices::shutdown) stops them and waits. When dropped, the `drop_guard`
/// cancels the shutdown token so the tasks stop on their own.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }

    pub fn task_count(&self) -> usize {
        self.background_tasks.len()
    }
}

/// Spawn the reconciler and order sweeper for `state`
pub fn start_background_services<S: Storage>(
    state: &AppState<S>,
    lookup: Arc<dyn UsageLookup>,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if state.config.reconciliation.enabled {
        let reconciler = FreezeReconciler::new(state.billing.clone(), lookup, state.config.reconciliation.clone());
        background_tasks.push(tokio::spawn(reconciler.run(shutdown_token.clone())));
    } else {
        info!("Freeze reconciliation disabled");
    }

    if state.config.recharge.sweeper_enabled {
        background_tasks.push(tokio::spawn(state.recharge.clone().run_sweeper(shutdown_token.clone())));
    } else {
        info!("Recharge order sweeper disabled");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Connect to PostgreSQL and run migrations
async fn setup_database(url: &str, pool: &PoolSettings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(pool.max_connections)
        .min_connections(pool.min_connections)
        .acquire_timeout(pool.acquire_timeout)
        .connect(url)
        .await?;

    migrator().run(&pool).await?;
    Ok(pool)
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] opens the configured storage, runs migrations and starts
///    background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, gracefully stops all services
pub struct Application {
    router: Router,
    config: Config,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_lookup(config, Arc::new(NoUsageLookup)).await
    }

    /// Like [`Application::new`], with a source of upstream usage for the reconciler
    pub async fn new_with_lookup(config: Config, lookup: Arc<dyn UsageLookup>) -> anyhow::Result<Self> {
        debug!(
            models = config.pricing.len(),
            packages = config.recharge.packages.len(),
            signed_callbacks = config.recharge.callback_secret.is_some(),
            "Starting ledger"
        );

        let shutdown_token = CancellationToken::new();

        match &config.database {
            DatabaseConfig::Memory => {
                info!("Using in-memory storage; ledger state will be lost on shutdown");
                let storage = Arc::new(InMemoryStorage::new());
                Ok(Self::assemble(storage, config, None, lookup, shutdown_token))
            }
            DatabaseConfig::Postgres { url, pool } => {
                info!("Using PostgreSQL storage");
                let pool = setup_database(url, pool).await?;
                let storage = Arc::new(PostgresStorage::new(pool.clone()));
                Ok(Self::assemble(storage, config, Some(pool), lookup, shutdown_token))
            }
        }
    }

    fn assemble<S: Storage>(
        storage: Arc<S>,
        config: Config,
        pool: Option<PgPool>,
        lookup: Arc<dyn UsageLookup>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let state = AppState::new(storage, config.clone());
        let bg_services = start_background_services(&state, lookup, shutdown_token);
        let router = build_router(state);

        Self {
            router,
            config,
            pool,
            bg_services,
        }
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
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
            "Ledger listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Shutdown background services and wait for tasks to complete
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
