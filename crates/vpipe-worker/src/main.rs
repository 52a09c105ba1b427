//! Transcoding worker binary.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use vpipe_firestore::{FirestoreClient, VideoRepository};
use vpipe_media::{check_ffmpeg, check_ffprobe, FfmpegTranscoder, TranscodeConfig};
use vpipe_queue::QueueConfig;
use vpipe_storage::gateway_from_env;
use vpipe_worker::logging::init_tracing;
use vpipe_worker::{connect_queue, metrics, ExitReason, JobExecutor, JobProcessor, WorkerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider was already installed");
    }

    init_tracing();
    info!("Starting vpipe-worker");

    match run().await {
        Ok(reason) => {
            info!(?reason, "Worker shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitReason> {
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::init_metrics(port)?;
        info!(port, "Prometheus metrics enabled");
    }

    check_ffmpeg().context("ffmpeg is required")?;
    check_ffprobe().context("ffprobe is required")?;

    let storage = gateway_from_env().await.context("Failed to create storage gateway")?;
    let firestore = FirestoreClient::from_env()
        .await
        .context("Failed to create Firestore client")?;
    let videos = VideoRepository::from_env(firestore);

    let processor = JobProcessor::new(
        Arc::new(FfmpegTranscoder::new(TranscodeConfig::from_env())),
        storage,
        Arc::new(videos),
        config.processor_config(),
    );

    let queue = connect_queue(&config, QueueConfig::from_env())
        .await
        .context("Failed to connect to Redis")?;

    let executor = Arc::new(JobExecutor::new(config, queue, processor));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    Ok(executor.run().await?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
