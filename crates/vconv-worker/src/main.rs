//! Video conversion worker binary.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vconv_media::FfmpegTranscoder;
use vconv_worker::{ClaimCoordinator, CoordinatorSettings, StorageConfig, Worker, WorkerConfig};

fn init_tracing() -> anyhow::Result<()> {
    // Colored text for dev, JSON lines for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vconv=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    config.validate()?;
    info!("Worker config: {:?}", config);

    let storage = StorageConfig::from_env()?;
    let backend = storage.connect().await.context("Failed to create storage backend")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transcoder = FfmpegTranscoder::new(config.transcoder_options())
        .context("FFmpeg is required")?
        .with_cancel(cancel_on_second_signal(shutdown_rx.clone()));

    let coordinator = ClaimCoordinator::new(
        backend,
        storage.layout(),
        config.worker_id.clone(),
        CoordinatorSettings::from(&config),
    );
    let worker = Worker::new(
        coordinator,
        Arc::new(transcoder),
        config.work_dir.clone(),
        config.concurrency,
    )
    .with_shutdown(shutdown_rx);

    // Setup signal handler: stop claiming, let in-flight items finish
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, finishing in-flight items");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = worker.run().await?;
    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some items failed");
    }
    Ok(())
}

/// Cancellation for running conversions: fires on a second Ctrl-C after
/// shutdown was requested.
fn cancel_on_second_signal(mut shutdown_rx: watch::Receiver<bool>) -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second shutdown signal, cancelling conversions");
            let _ = cancel_tx.send(true);
        }
    });
    cancel_rx
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("Starting vconv-worker");
    let started = Instant::now();

    let result = run().await;
    info!("Total runtime: {:.2}s", started.elapsed().as_secs_f64());

    if let Err(e) = result {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}
