//! Controller configuration.

use std::time::Duration;

/// Settings forwarded from the controller's environment to every worker.
pub const PASSTHROUGH_VARS: &[&str] = &[
    "STORAGE_ENDPOINT_URL",
    "STORAGE_ACCESS_KEY_ID",
    "STORAGE_SECRET_ACCESS_KEY",
    "STORAGE_BUCKET",
    "STORAGE_REGION",
    "STORAGE_PUBLIC_BASE_URL",
    "STORAGE_OUTPUT_PREFIX",
    "GCP_PROJECT_ID",
    "FIREBASE_PROJECT_ID",
    "FIRESTORE_DATABASE_ID",
    "FIRESTORE_VIDEOS_COLLECTION",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GOOGLE_APPLICATION_CREDENTIALS_JSON",
    "WORKER_MAX_DURATION_SECS",
    "WORKER_MAX_SOURCE_BYTES",
    "WORKER_IDLE_TIMEOUT_SECS",
    "LOG_FORMAT",
    "RUST_LOG",
];

/// Batch job submission settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub job_queue: String,
    pub job_definition: String,
    /// Submitted jobs are named `<prefix>-<uuid>`
    pub job_name_prefix: String,
    pub vcpus: u32,
    pub memory_mib: u32,
    /// AWS region; the default provider chain decides when unset
    pub region: Option<String>,
    /// Extra container environment, in submission order
    pub environment: Vec<(String, String)>,
}

impl BatchConfig {
    pub fn new(job_queue: impl Into<String>, job_definition: impl Into<String>) -> Self {
        Self {
            job_queue: job_queue.into(),
            job_definition: job_definition.into(),
            job_name_prefix: "vpipe-worker".to_string(),
            vcpus: 2,
            memory_mib: 4096,
            region: None,
            environment: Vec::new(),
        }
    }

    /// Batch settings from the environment, `None` when the queue or
    /// definition is missing.
    pub fn from_env() -> Option<Self> {
        let job_queue = non_empty_env("BATCH_JOB_QUEUE")?;
        let job_definition = non_empty_env("BATCH_JOB_DEFINITION")?;
        let defaults = Self::new(job_queue, job_definition);

        let environment = PASSTHROUGH_VARS
            .iter()
            .filter_map(|name| non_empty_env(name).map(|value| (name.to_string(), value)))
            .collect();

        Some(Self {
            job_name_prefix: non_empty_env("BATCH_JOB_NAME_PREFIX").unwrap_or(defaults.job_name_prefix.clone()),
            vcpus: env_parse("BATCH_VCPUS").unwrap_or(defaults.vcpus),
            memory_mib: env_parse("BATCH_MEMORY_MIB").unwrap_or(defaults.memory_mib),
            region: non_empty_env("BATCH_REGION").or_else(|| non_empty_env("AWS_REGION")),
            environment,
            ..defaults
        })
    }
}

/// Autoscaling controller configuration.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub poll_interval: Duration,
    /// Backlog that triggers scaling when no consumer is active
    pub threshold_no_consumers: u64,
    /// Backlog that triggers scaling otherwise
    pub threshold: u64,
    /// Minimum time between scale actions
    pub cooldown: Duration,
    /// Queue depth one worker is expected to absorb
    pub jobs_per_worker: u64,
    /// Cap on running plus pending batch workers
    pub max_workers: u32,
    /// Redis URL; scaling is disabled without one
    pub redis_url: Option<String>,
    /// Batch settings; scaling is disabled without them
    pub batch: Option<BatchConfig>,
    pub host: String,
    pub port: u16,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            threshold_no_consumers: 1,
            threshold: 5,
            cooldown: Duration::from_secs(120),
            jobs_per_worker: 5,
            max_workers: 10,
            redis_url: None,
            batch: None,
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

impl ScalerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_parse("SCALER_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            threshold_no_consumers: env_parse("SCALER_THRESHOLD_NO_CONSUMERS")
                .unwrap_or(defaults.threshold_no_consumers),
            threshold: env_parse("SCALER_THRESHOLD").unwrap_or(defaults.threshold),
            cooldown: env_parse("SCALER_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            jobs_per_worker: env_parse("SCALER_JOBS_PER_WORKER").unwrap_or(defaults.jobs_per_worker),
            max_workers: env_parse("SCALER_MAX_WORKERS").unwrap_or(defaults.max_workers),
            redis_url: non_empty_env("REDIS_URL"),
            batch: BatchConfig::from_env(),
            host: std::env::var("SCALER_HOST").unwrap_or(defaults.host),
            port: env_parse("SCALER_PORT").unwrap_or(defaults.port),
        }
    }

    /// Scaling needs both a queue to watch and somewhere to submit workers.
    pub fn is_enabled(&self) -> bool {
        self.redis_url.is_some() && self.batch.is_some()
    }

    /// Backlog at which to scale, never below one.
    pub fn threshold_for(&self, active_consumers: u32) -> u64 {
        let threshold = if active_consumers == 0 {
            self.threshold_no_consumers
        } else {
            self.threshold
        };
        threshold.max(1)
    }

    /// Workers to submit for a backlog, given the batch workers already active.
    pub fn desired_workers(&self, depth: u64, active_consumers: u32, active_jobs: u32) -> u32 {
        if depth == 0 || depth < self.threshold_for(active_consumers) {
            return 0;
        }
        let wanted = depth.div_ceil(self.jobs_per_worker.max(1));
        let wanted = u32::try_from(wanted).unwrap_or(u32::MAX);
        let headroom = self.max_workers.saturating_sub(active_jobs);
        wanted.saturating_sub(active_jobs).min(headroom)
    }

    /// Cap a manual request to the remaining headroom.
    pub fn capped(&self, requested: u32, active_jobs: u32) -> u32 {
        requested.min(self.max_workers.saturating_sub(active_jobs))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> ScalerConfig {
        ScalerConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            batch: Some(BatchConfig::new("queue", "def")),
            ..Default::default()
        }
    }

    #[test]
    fn test_enabled_requires_both() {
        assert!(enabled().is_enabled());
        assert!(!ScalerConfig::default().is_enabled());
        let no_batch = ScalerConfig {
            batch: None,
            ..enabled()
        };
        assert!(!no_batch.is_enabled());
    }

    #[test]
    fn test_threshold_depends_on_consumers() {
        let config = enabled();
        assert_eq!(config.threshold_for(0), 1);
        assert_eq!(config.threshold_for(3), 5);

        let zeroed = ScalerConfig {
            threshold_no_consumers: 0,
            threshold: 0,
            ..enabled()
        };
        assert_eq!(zeroed.threshold_for(0), 1);
        assert_eq!(zeroed.threshold_for(2), 1);
    }

    #[test]
    fn test_desired_workers() {
        let config = enabled();
        assert_eq!(config.desired_workers(0, 0, 0), 0);
        // One waiting job, no consumers
        assert_eq!(config.desired_workers(1, 0, 0), 1);
        // Same backlog with a consumer around stays below threshold
        assert_eq!(config.desired_workers(1, 1, 0), 0);
        assert_eq!(config.desired_workers(12, 1, 0), 3);
        assert_eq!(config.desired_workers(12, 1, 2), 1);
        assert_eq!(config.desired_workers(12, 1, 3), 0);
        // Capped by max_workers
        assert_eq!(config.desired_workers(500, 0, 0), 10);
        assert_eq!(config.desired_workers(500, 0, 8), 2);
        assert_eq!(config.desired_workers(500, 0, 12), 0);
    }

    #[test]
    fn test_capped() {
        let config = enabled();
        assert_eq!(config.capped(3, 0), 3);
        assert_eq!(config.capped(50, 4), 6);
        assert_eq!(config.capped(5, 10), 0);
    }
}
