//! Grindstone - daily reconciliation daemon

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grindstone::{
    config::{Args, StoreBackend},
    reset::{spawn_daily_reset_task, ReconciliationEngine, ScheduleConfig},
    store::{GameStore, MemoryStore, RestStore, SqliteStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("grindstone={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Grindstone - daily reconciliation");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!(
        "Backend: {}",
        match args.store_backend {
            StoreBackend::Sqlite => format!("sqlite ({})", args.sqlite_path),
            StoreBackend::Rest => format!(
                "rest ({})",
                args.rest_url.as_deref().unwrap_or_default()
            ),
            StoreBackend::Memory => "memory (dev mode, volatile)".to_string(),
        }
    );
    info!("Reset schedule: {:02}:{:02} local", args.reset_hour, args.reset_minute);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("======================================");

    let store: Arc<dyn GameStore> = match args.store_backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&args.sqlite_path)?;
            info!("SQLite store opened");
            Arc::new(store)
        }
        StoreBackend::Rest => {
            // validate() guarantees both are present
            let url = args.rest_url.clone().unwrap_or_default();
            let key = args.rest_service_key.clone().unwrap_or_default();
            let store = RestStore::new(&url, &key)?;
            info!("REST store configured");
            Arc::new(store)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let engine = ReconciliationEngine::new(store);

    if args.run_once {
        let summary = engine.run_daily_reset(chrono::Utc::now()).await;
        info!(
            habits_penalized = summary.habits_penalized,
            tasks_failed = summary.tasks_failed,
            errors = summary.errors,
            "single reset run finished"
        );
        return Ok(());
    }

    let scheduler = spawn_daily_reset_task(
        engine,
        ScheduleConfig {
            hour: args.reset_hour,
            minute: args.reset_minute,
            run_timeout: std::time::Duration::from_secs(args.reset_timeout_secs),
        },
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.abort();

    Ok(())
}
