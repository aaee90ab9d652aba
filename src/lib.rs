//! Service Queue - vehicle service shop queue core
//!
//! Keeps the cars and motorcycles queue of a wash/detailing shop in sync
//! with a shared database: local mirrors of the vehicle, catalog and crew
//! tables, validated writes, the status lifecycle, change-driven refetches
//! and customer notifications.
//!
//! [`QueueCore`] is the entry point for embedding. The `service-queue`
//! binary wires it to a store and notifier from [`Config`] and logs the
//! customer board on every change.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod derived;
pub mod diagnostics;
pub mod error;
pub mod kiosk;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod pricing;
pub mod queue;
pub mod storage;
pub mod store;
pub mod tracker;
pub mod validation;

pub use api::SupabaseStore;
pub use config::Config;
pub use db::SqliteStore;
pub use error::{QueueError, QueueResult, StoreError, StoreErrorKind, ValidationError};
pub use kiosk::KioskBoard;
pub use models::{
    Car, CrewDraft, CrewMember, CrewPatch, HistoryMatch, Motorcycle, PackageDraft, PackagePatch,
    Service, ServiceDraft, ServicePackage, ServicePatch, Vehicle, VehicleBase, VehicleDraft,
    VehicleKind, VehiclePatch, VehicleSize, VehicleStatus,
};
pub use notify::{HttpNotifier, NoopNotifier, NotificationPayload, Notifier};
pub use queue::{QueueCore, QueueSettings, QueueState};
pub use store::{ChangeEvent, ChangeOp, DataStore, Filter, Query, Subscription, Table};
pub use tracker::{OperationKind, OperationTracker};

const USAGE: &str = "usage: service-queue [run | set-credential <key> <value> | clear-credentials]";

// ============================================================================
// Logging
// ============================================================================

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,service_queue_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes and stops the writer; the process owns it
    // until exit.
    std::mem::forget(guard);
}

// ============================================================================
// Service
// ============================================================================

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn DataStore>> {
    match config.remote() {
        Some((url, key)) => {
            let store = SupabaseStore::new(url, key, config.poll_interval())
                .context("Failed to set up the hosted queue database")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No hosted database configured, using the local store");
            let store = SqliteStore::open(&config.database_path).with_context(|| {
                format!("Failed to open {}", config.database_path.display())
            })?;
            Ok(Arc::new(store))
        }
    }
}

fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    match config.sms_webhook_url.as_deref() {
        Some(endpoint) => {
            let notifier =
                HttpNotifier::new(endpoint).context("Failed to set up the SMS notifier")?;
            info!(endpoint, "Customer notifications enabled");
            Ok(Arc::new(notifier))
        }
        None => {
            info!("No SMS webhook configured, customer notifications disabled");
            Ok(Arc::new(NoopNotifier))
        }
    }
}

fn log_board(core: &QueueCore) {
    let board = KioskBoard::capture(core);
    info!(
        waiting = board.waiting.len(),
        in_service = board.in_service.len(),
        payment_pending = board.payment_pending.len(),
        "queue board updated"
    );
    for line in board.render() {
        debug!(target: "service_queue_lib::kiosk", "{line}");
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = build_store(&config)?;
    let notifier = build_notifier(&config)?;
    let core = QueueCore::new(store, notifier, QueueSettings::from(&config));

    core.start().await;
    if let Some(error) = core.last_error() {
        warn!(%error, "Initial load incomplete");
    }
    log_board(&core);

    let board_task = {
        let core = core.clone();
        let mut revisions = core.revisions();
        tokio::spawn(async move {
            while revisions.changed().await.is_ok() {
                log_board(&core);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    board_task.abort();
    core.shutdown().await;
    info!("Service queue stopped");
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => {}
        ["set-credential", key, value] => {
            storage::set_credential(key, value).map_err(anyhow::Error::msg)?;
            return Ok(());
        }
        ["clear-credentials"] => {
            let failed = storage::clear_credentials();
            if !failed.is_empty() {
                anyhow::bail!("Failed to clear credentials: {}", failed.join(", "));
            }
            return Ok(());
        }
        _ => anyhow::bail!("{USAGE}"),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        "Starting Service Queue"
    );

    let config = Config::load();
    debug!(?config, "Configuration resolved");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(serve(config))
}
