mod clock;
mod config;
mod error;
mod fertilizer;
mod pump;
mod schedule;
mod scheduler;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use fertilizer::FertilizerMonitor;
use pump::PumpController;
use scheduler::{IrrigationScheduler, SchedulerSettings};
use state::EventKind;
use store::{FirebaseStore, StateStore};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let irrigation = &cfg.irrigation;

    // ── Store & clock ───────────────────────────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(
        FirebaseStore::new(
            &cfg.store.base_url,
            cfg.store.auth_token.clone(),
            cfg.store.timeout(),
        )
        .context("failed to build store client")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(irrigation.offset()?));

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = state::new_shared();
    {
        let mut st = shared.write().await;
        st.notify(EventKind::System, "controller started");
    }

    // ── Components ──────────────────────────────────────────────────
    let pump = PumpController::new(
        Arc::clone(&store),
        irrigation.pump_path(),
        Arc::clone(&clock),
        shared.clone(),
    );
    let default_duration = irrigation.default_duration()?;
    let scheduler = IrrigationScheduler::new(
        SchedulerSettings {
            mode_path: irrigation.mode_path(),
            schedule_path: irrigation.schedule_path(),
            default_schedule: irrigation.schedule()?,
            default_duration,
        },
        Arc::clone(&store),
        pump.clone(),
        Arc::clone(&clock),
        shared.clone(),
    );
    let monitor = FertilizerMonitor::new(cfg.fertilizer.clone(), Arc::clone(&store), shared.clone());

    // Initial sync; an unreachable store is retried by the poll loop.
    if let Err(e) = scheduler.refresh().await {
        warn!("initial refresh failed: {e}");
    }

    let poll_interval = irrigation.poll_interval();
    let scheduler_task = tokio::spawn(scheduler::run(scheduler.clone(), poll_interval));
    let monitor_task = tokio::spawn(fertilizer::run(monitor.clone(), poll_interval));

    // ── Web API ─────────────────────────────────────────────────────
    let app = AppState {
        shared: shared.clone(),
        pump: pump.clone(),
        scheduler: scheduler.clone(),
        fertilizer: monitor,
        default_duration,
    };
    let port = cfg.web.port;
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(app, port).await {
            error!("web server error: {e:#}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    scheduler_task.abort();
    monitor_task.abort();
    web_task.abort();
    scheduler.shutdown().await;
    pump.shutdown().await;

    Ok(())
}
