//! Autoscaling controller binary.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpipe_queue::QueueConfig;
use vpipe_scaler::{
    create_router, metrics, AppState, AwsBatchClient, Backends, RedisInspector, ScalerConfig, ScalingController,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider was already installed");
    }

    init_tracing();
    info!("Starting vpipe-scaler");

    match run().await {
        Ok(()) => {
            info!("Scaler shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Scaler failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vpipe=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ScalerConfig::from_env();
    info!(
        enabled = config.is_enabled(),
        threshold = config.threshold,
        threshold_no_consumers = config.threshold_no_consumers,
        max_workers = config.max_workers,
        "Scaler config loaded"
    );

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    let metrics_handle = if metrics_enabled {
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    let backends = match (&config.redis_url, &config.batch) {
        (Some(redis_url), Some(batch)) => {
            let queue_config = QueueConfig {
                redis_url: redis_url.clone(),
                ..QueueConfig::from_env()
            };
            let batch = AwsBatchClient::new(batch.clone(), &queue_config).await;
            Some(Backends {
                inspector: Arc::new(RedisInspector::new(queue_config)),
                batch: Arc::new(batch),
            })
        }
        _ => {
            warn!("Autoscaling disabled: REDIS_URL, BATCH_JOB_QUEUE and BATCH_JOB_DEFINITION are required");
            None
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;

    let controller = Arc::new(ScalingController::new(config, backends));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run(shutdown_rx).await })
    };

    let app = create_router(AppState::new(controller, metrics_handle));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown_tx.send_replace(true);
    if let Err(e) = poller.await {
        warn!("Scaling loop ended abnormally: {}", e);
    }
    Ok(())
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
    info!("Received shutdown signal");
}
