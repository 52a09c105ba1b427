//! Autoscaling snapshot and batch-compute job models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of a scale-up action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleActionKind {
    /// Decided by the poll loop
    Automatic,
    /// Requested through the trigger endpoint
    Manual,
}

impl ScaleActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleActionKind::Automatic => "automatic",
            ScaleActionKind::Manual => "manual",
        }
    }
}

/// Last scale-up action taken by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleAction {
    pub timestamp: DateTime<Utc>,
    pub kind: ScaleActionKind,
    /// Number of batch jobs submitted
    pub count: u32,
}

/// Controller state snapshot, served by `GET /scaling/metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingMetrics {
    /// Undelivered messages in the job stream
    pub queue_depth: u64,
    /// Consumers seen recently on the consumer group
    pub active_consumers: u32,
    /// Batch workers in the running state
    pub batch_jobs_running: u32,
    /// Batch workers submitted but not yet running
    pub batch_jobs_pending: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scale_action: Option<ScaleAction>,
    /// Batch jobs submitted over the process lifetime
    pub total_jobs_submitted: u64,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ScalingMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Running plus pending batch workers.
    pub fn active_batch_jobs(&self) -> u32 {
        self.batch_jobs_running + self.batch_jobs_pending
    }
}

/// AWS Batch job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchJobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl BatchJobStatus {
    /// Statuses that count as live capacity.
    pub const ACTIVE: [BatchJobStatus; 5] = [
        BatchJobStatus::Submitted,
        BatchJobStatus::Pending,
        BatchJobStatus::Runnable,
        BatchJobStatus::Starting,
        BatchJobStatus::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobStatus::Submitted => "SUBMITTED",
            BatchJobStatus::Pending => "PENDING",
            BatchJobStatus::Runnable => "RUNNABLE",
            BatchJobStatus::Starting => "STARTING",
            BatchJobStatus::Running => "RUNNING",
            BatchJobStatus::Succeeded => "SUCCEEDED",
            BatchJobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(BatchJobStatus::Submitted),
            "PENDING" => Some(BatchJobStatus::Pending),
            "RUNNABLE" => Some(BatchJobStatus::Runnable),
            "STARTING" => Some(BatchJobStatus::Starting),
            "RUNNING" => Some(BatchJobStatus::Running),
            "SUCCEEDED" => Some(BatchJobStatus::Succeeded),
            "FAILED" => Some(BatchJobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BatchJobStatus::Running)
    }
}

impl fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A worker job as reported by AWS Batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub job_id: String,
    pub job_name: String,
    pub status: BatchJobStatus,
}
