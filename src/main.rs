use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hookline::config::Config;
use hookline::ingress::{self, IngressHandler, LoggingApplication};
use hookline::logging::{self, Sinks};
use hookline::maintenance::{ChannelQueue, MaintenanceJob, MaintenanceTrigger, SystemClock};
use hookline::webhook::register_on_startup;

/// How often the maintenance table is evaluated.
const SCHEDULER_TICK: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hookline.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let _guard = logging::init(&config, "hookline.log", Sinks::Service);

    info!("🚀 Starting hookline...");
    info!("Loaded config from {config_path}");
    match config.bot_id() {
        Some(id) => info!("Bot id: {id}"),
        None => warn!("No bot token configured; deliveries will be answered with 500"),
    }

    // Before the listener exists, so the platform cannot deliver to a
    // half-started process. Bounded by request_timeout per call.
    register_on_startup(&config).await;

    let (queue, jobs) = ChannelQueue::new(config.job_queue_capacity);
    let scheduler = match MaintenanceTrigger::from_config(&config, queue, Utc::now()) {
        Ok(trigger) => Some(trigger.spawn(SystemClock, SCHEDULER_TICK)),
        Err(e) => {
            error!("Maintenance schedule invalid, scheduler disabled: {e}");
            None
        }
    };
    tokio::spawn(hand_off_jobs(jobs));

    let handler = Arc::new(IngressHandler::new(
        LoggingApplication,
        config.telegram_bot_token.as_deref(),
        Some(config.api_base_url.clone()),
        config.webhook_secret.clone(),
    ));

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.listen_addr);
            std::process::exit(1);
        }
    };

    if let Err(e) = ingress::serve(listener, ingress::router(handler), shutdown_signal()).await {
        error!("HTTP server error: {e}");
    }

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    info!("Stopped");
}

/// Consumer end of the job queue; the worker pool picks jobs up from here.
async fn hand_off_jobs(mut jobs: mpsc::Receiver<MaintenanceJob>) {
    while let Some(job) = jobs.recv().await {
        info!(
            "Handing {} ({}) to workers, scheduled for {}",
            job.name, job.task, job.scheduled_for
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
