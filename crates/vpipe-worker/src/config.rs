//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::retry::RetryConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name within the group
    pub consumer_name: String,
    /// Maximum unacknowledged deliveries held at once
    pub prefetch: usize,
    /// Scratch directory root for per-job files
    pub work_dir: PathBuf,
    /// Base directory for relative source paths
    pub source_dir: Option<PathBuf>,
    /// Object key prefix for published outputs
    pub output_prefix: String,
    /// Longest source accepted, in seconds
    pub max_duration_secs: f64,
    /// Largest source accepted, in bytes
    pub max_source_bytes: Option<u64>,
    /// Reconnect attempts before giving up
    pub reconnect_max_retries: u32,
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
    /// How often to scan for stale deliveries of crashed workers
    pub claim_interval: Duration,
    /// Exit when idle (batch-compute mode)
    pub idle_exit: bool,
    /// Time without finished jobs before an idle exit
    pub idle_timeout: Duration,
    /// How often the idle condition is checked
    pub idle_check_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout: Duration,
    /// Port for the Prometheus exporter
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: default_consumer_name(),
            prefetch: 1,
            work_dir: PathBuf::from("/tmp/vpipe"),
            source_dir: None,
            output_prefix: "videos".to_string(),
            max_duration_secs: 600.0,
            max_source_bytes: None,
            reconnect_max_retries: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            claim_interval: Duration::from_secs(60),
            idle_exit: false,
            idle_timeout: Duration::from_secs(300),
            idle_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(300),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            consumer_name: std::env::var("WORKER_CONSUMER_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.consumer_name),
            prefetch: std::env::var("WORKER_PREFETCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.prefetch),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            source_dir: std::env::var("WORKER_SOURCE_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            output_prefix: std::env::var("STORAGE_OUTPUT_PREFIX").unwrap_or(defaults.output_prefix),
            max_duration_secs: std::env::var("WORKER_MAX_DURATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_duration_secs),
            max_source_bytes: std::env::var("WORKER_MAX_SOURCE_BYTES")
                .ok()
                .and_then(|s| s.parse().ok()),
            reconnect_max_retries: std::env::var("WORKER_RECONNECT_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.reconnect_max_retries),
            reconnect_base_delay: defaults.reconnect_base_delay,
            reconnect_max_delay: defaults.reconnect_max_delay,
            claim_interval: secs("WORKER_CLAIM_INTERVAL_SECS", defaults.claim_interval),
            idle_exit: std::env::var("WORKER_IDLE_EXIT")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            idle_timeout: secs("WORKER_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            idle_check_interval: secs("WORKER_IDLE_CHECK_SECS", defaults.idle_check_interval),
            shutdown_timeout: secs("WORKER_SHUTDOWN_TIMEOUT", defaults.shutdown_timeout),
            metrics_port: std::env::var("WORKER_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Backoff policy for broker reconnects.
    pub fn reconnect_policy(&self) -> RetryConfig {
        RetryConfig::new("redis_reconnect")
            .with_max_retries(self.reconnect_max_retries)
            .with_base_delay(self.reconnect_base_delay)
            .with_max_delay(self.reconnect_max_delay)
    }

    /// Settings the job processor needs.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            work_dir: self.work_dir.clone(),
            source_dir: self.source_dir.clone(),
            output_prefix: self.output_prefix.clone(),
            max_duration_secs: self.max_duration_secs,
            max_source_bytes: self.max_source_bytes,
        }
    }
}

/// Per-job processing limits and locations.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub work_dir: PathBuf,
    pub source_dir: Option<PathBuf>,
    pub output_prefix: String,
    pub max_duration_secs: f64,
    pub max_source_bytes: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        WorkerConfig::default().processor_config()
    }
}

/// `<hostname>-<short uuid>`, unique per process.
fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &id[..8])
}
