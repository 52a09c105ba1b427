//! Batch-compute seam and the AWS Batch implementation.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_batch::config::Region;
use aws_sdk_batch::error::DisplayErrorContext;
use aws_sdk_batch::operation::submit_job::SubmitJobOutput;
use aws_sdk_batch::types::{
    ContainerOverrides, JobStatus, JobSummary, KeyValuePair, ResourceRequirement, ResourceType,
};
use aws_sdk_batch::Client;
use tracing::{debug, info};
use uuid::Uuid;

use vpipe_models::{BatchJob, BatchJobStatus};
use vpipe_queue::QueueConfig;

use crate::config::BatchConfig;
use crate::error::{ScalerError, ScalerResult};

/// Submits and lists worker jobs.
#[async_trait]
pub trait BatchCompute: Send + Sync {
    /// Submit one worker job and return its job ID.
    async fn submit_worker(&self) -> ScalerResult<String>;

    /// Worker jobs submitted by this controller that are not yet finished.
    async fn list_active_jobs(&self) -> ScalerResult<Vec<BatchJob>>;
}

/// Container environment for a submitted worker.
///
/// The full queue configuration comes first, so workers declare the same
/// stream arguments as everyone else, then the pass-through settings.
/// Workers always run with idle exit enabled.
pub fn worker_environment(batch: &BatchConfig, queue: &QueueConfig) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = queue
        .to_env()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    env.push(("WORKER_IDLE_EXIT".to_string(), "true".to_string()));
    for (name, value) in &batch.environment {
        if !env.iter().any(|(existing, _)| existing == name) {
            env.push((name.clone(), value.clone()));
        }
    }
    env
}

/// `<prefix>-<uuid>`; AWS Batch allows letters, digits, hyphens and underscores.
pub fn job_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Job ID from a submission response.
fn submitted_job_id(output: &SubmitJobOutput) -> ScalerResult<String> {
    output
        .job_id()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ScalerError::batch("submit_job returned no job ID"))
}

/// Summaries of this controller's workers. Entries without an ID or name are
/// skipped.
fn worker_jobs(summaries: &[JobSummary], prefix: &str, status: BatchJobStatus) -> Vec<BatchJob> {
    summaries
        .iter()
        .filter_map(|s| {
            let job_name = s.job_name().filter(|name| name.starts_with(prefix))?;
            let job_id = s.job_id()?;
            Some(BatchJob {
                job_id: job_id.to_string(),
                job_name: job_name.to_string(),
                status,
            })
        })
        .collect()
}

/// AWS Batch client for worker jobs.
#[derive(Clone)]
pub struct AwsBatchClient {
    client: Client,
    config: BatchConfig,
    environment: Vec<(String, String)>,
}

impl AwsBatchClient {
    /// Build a client using the default AWS credential chain.
    pub async fn new(config: BatchConfig, queue: &QueueConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        Self {
            client: Client::new(&sdk_config),
            environment: worker_environment(&config, queue),
            config,
        }
    }

    fn container_overrides(&self) -> ContainerOverrides {
        let environment = self
            .environment
            .iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect::<Vec<_>>();

        let vcpu = ResourceRequirement::builder()
            .r#type(ResourceType::Vcpu)
            .value(self.config.vcpus.to_string())
            .build();
        let memory = ResourceRequirement::builder()
            .r#type(ResourceType::Memory)
            .value(self.config.memory_mib.to_string())
            .build();

        ContainerOverrides::builder()
            .set_environment(Some(environment))
            .resource_requirements(vcpu)
            .resource_requirements(memory)
            .build()
    }
}

#[async_trait]
impl BatchCompute for AwsBatchClient {
    async fn submit_worker(&self) -> ScalerResult<String> {
        let name = job_name(&self.config.job_name_prefix);
        let output = self
            .client
            .submit_job()
            .job_name(&name)
            .job_queue(&self.config.job_queue)
            .job_definition(&self.config.job_definition)
            .container_overrides(self.container_overrides())
            .send()
            .await
            .map_err(|e| ScalerError::batch(format!("submit_job: {}", DisplayErrorContext(&e))))?;

        let job_id = submitted_job_id(&output)?;
        info!(job_id = %job_id, job_name = %name, "Submitted worker job");
        Ok(job_id)
    }

    async fn list_active_jobs(&self) -> ScalerResult<Vec<BatchJob>> {
        let mut jobs = Vec::new();

        for status in BatchJobStatus::ACTIVE {
            let mut next_token: Option<String> = None;
            loop {
                let output = self
                    .client
                    .list_jobs()
                    .job_queue(&self.config.job_queue)
                    .job_status(JobStatus::from(status.as_str()))
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .map_err(|e| ScalerError::batch(format!("list_jobs: {}", DisplayErrorContext(&e))))?;

                jobs.extend(worker_jobs(
                    output.job_summary_list(),
                    &self.config.job_name_prefix,
                    status,
                ));

                match output.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
        }

        debug!(count = jobs.len(), "Listed active worker jobs");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_has_prefix() {
        let name = job_name("vpipe-worker");
        assert!(name.starts_with("vpipe-worker-"));
        assert_eq!(name.len(), "vpipe-worker-".len() + 36);
        assert_ne!(job_name("vpipe-worker"), name);
    }

    #[test]
    fn test_worker_environment() {
        let mut batch = BatchConfig::new("queue", "def");
        batch.environment = vec![
            ("STORAGE_BUCKET".to_string(), "media".to_string()),
            ("WORKER_IDLE_EXIT".to_string(), "false".to_string()),
        ];
        let queue = QueueConfig {
            redis_url: "redis://cache:6379".to_string(),
            message_ttl: std::time::Duration::from_secs(3600),
            claim_min_idle: std::time::Duration::from_secs(900),
            dlq_group: "ops".to_string(),
            ..Default::default()
        };

        let env = worker_environment(&batch, &queue);
        let get = |name: &str| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("REDIS_URL"), Some("redis://cache:6379"));
        assert_eq!(get("QUEUE_STREAM"), Some("vpipe:transcode"));
        assert_eq!(get("QUEUE_CONSUMER_GROUP"), Some("vpipe:transcoders"));
        assert_eq!(get("QUEUE_MESSAGE_TTL"), Some("3600"));
        assert_eq!(get("QUEUE_MAX_DELIVERIES"), Some("3"));
        assert_eq!(get("QUEUE_DLQ_STREAM"), Some("vpipe:transcode:dlq"));
        assert_eq!(get("QUEUE_DLQ_GROUP"), Some("ops"));
        assert_eq!(get("QUEUE_CLAIM_MIN_IDLE_SECS"), Some("900"));
        assert_eq!(get("WORKER_IDLE_EXIT"), Some("true"));
        assert_eq!(get("STORAGE_BUCKET"), Some("media"));
        assert_eq!(env.iter().filter(|(k, _)| k == "WORKER_IDLE_EXIT").count(), 1);
    }

    #[test]
    fn test_submitted_job_id_requires_id() {
        let output = SubmitJobOutput::builder().job_name("vpipe-worker-1").job_id("abc").build();
        assert_eq!(submitted_job_id(&output).unwrap(), "abc");

        let output = SubmitJobOutput::builder().job_name("vpipe-worker-1").build();
        assert!(matches!(submitted_job_id(&output), Err(ScalerError::Batch(_))));
    }

    #[test]
    fn test_worker_jobs_skip_foreign_and_incomplete_summaries() {
        let summaries = vec![
            JobSummary::builder().job_id("1").job_name("vpipe-worker-a").build(),
            JobSummary::builder().job_id("2").job_name("other-job").build(),
            JobSummary::builder().job_id("3").build(),
            JobSummary::builder().job_name("vpipe-worker-b").build(),
        ];

        let jobs = worker_jobs(&summaries, "vpipe-worker", BatchJobStatus::Running);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "1");
        assert_eq!(jobs[0].job_name, "vpipe-worker-a");
        assert_eq!(jobs[0].status, BatchJobStatus::Running);
    }
}
