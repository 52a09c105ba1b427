//! Autoscaling control loop.
//!
//! Each tick observes the queue backlog and the batch workers this controller
//! has submitted, then submits more workers when the backlog warrants it.
//! Scale-down is left to the workers' idle exit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vpipe_models::{ScaleAction, ScaleActionKind, ScalingMetrics};

use crate::batch::BatchCompute;
use crate::config::ScalerConfig;
use crate::error::{ScalerError, ScalerResult};
use crate::inspector::QueueInspector;
use crate::metrics;

/// Collaborators of an enabled controller.
#[derive(Clone)]
pub struct Backends {
    pub inspector: Arc<dyn QueueInspector>,
    pub batch: Arc<dyn BatchCompute>,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    pub requested: u32,
    pub submitted: u32,
    pub job_ids: Vec<String>,
}

struct ControllerState {
    metrics: ScalingMetrics,
    last_action_at: Option<Instant>,
}

pub struct ScalingController {
    config: ScalerConfig,
    backends: Option<Backends>,
    /// Serializes ticks and triggers
    actions: Mutex<()>,
    /// Held only to read or write the snapshot
    state: Mutex<ControllerState>,
}

impl ScalingController {
    /// Without backends the controller reports itself disabled and never acts.
    pub fn new(config: ScalerConfig, backends: Option<Backends>) -> Self {
        let enabled = backends.is_some();
        Self {
            config,
            backends,
            actions: Mutex::new(()),
            state: Mutex::new(ControllerState {
                metrics: ScalingMetrics::new(enabled),
                last_action_at: None,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backends.is_some()
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    /// Current snapshot.
    pub async fn metrics(&self) -> ScalingMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// Run one poll. Returns the number of workers submitted.
    ///
    /// Failures are logged and kept as `last_error`; the previously observed
    /// values stay in place.
    pub async fn tick(&self) -> u32 {
        let Some(backends) = &self.backends else {
            return 0;
        };

        let _action = self.actions.lock().await;
        match self.evaluate(backends).await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!("Scaling check failed: {}", e);
                metrics::record_poll_error();
                self.state.lock().await.metrics.last_error = Some(e.to_string());
                0
            }
        }
    }

    async fn evaluate(&self, backends: &Backends) -> ScalerResult<u32> {
        let backlog = backends.inspector.backlog().await?;
        let jobs = backends.batch.list_active_jobs().await?;

        let running = jobs.iter().filter(|j| j.status.is_running()).count() as u32;
        let pending = (jobs.len() as u32).saturating_sub(running);

        {
            let mut state = self.state.lock().await;
            state.metrics.queue_depth = backlog.depth;
            state.metrics.active_consumers = backlog.active_consumers;
            state.metrics.batch_jobs_running = running;
            state.metrics.batch_jobs_pending = pending;
            state.metrics.last_checked = Some(Utc::now());
            state.metrics.last_error = None;
        }
        metrics::set_observed(backlog.depth, backlog.active_consumers, running, pending);

        let active = running + pending;
        let desired = self
            .config
            .desired_workers(backlog.depth, backlog.active_consumers, active);
        if desired == 0 {
            debug!(
                depth = backlog.depth,
                consumers = backlog.active_consumers,
                active,
                "No scale-up needed"
            );
            return Ok(0);
        }

        if let Some(remaining) = self.cooldown_remaining().await {
            info!(
                depth = backlog.depth,
                remaining_secs = remaining.as_secs(),
                "Backlog above threshold but in cooldown"
            );
            return Ok(0);
        }

        info!(
            depth = backlog.depth,
            consumers = backlog.active_consumers,
            active,
            desired,
            "Scaling up"
        );
        let job_ids = self.submit(backends, desired, ScaleActionKind::Automatic).await?;
        Ok(job_ids.len() as u32)
    }

    /// Submit workers on request, bypassing threshold and cooldown but not
    /// the worker cap.
    pub async fn trigger(&self, requested: u32) -> ScalerResult<TriggerOutcome> {
        let Some(backends) = &self.backends else {
            return Err(ScalerError::Disabled);
        };

        let _action = self.actions.lock().await;
        let active = backends.batch.list_active_jobs().await?.len() as u32;
        let count = self.config.capped(requested, active);
        if count == 0 {
            info!(requested, active, "Worker cap reached, nothing submitted");
            return Ok(TriggerOutcome {
                requested,
                submitted: 0,
                job_ids: Vec::new(),
            });
        }

        info!(requested, count, active, "Manual scale-up");
        let job_ids = self.submit(backends, count, ScaleActionKind::Manual).await?;
        Ok(TriggerOutcome {
            requested,
            submitted: job_ids.len() as u32,
            job_ids,
        })
    }

    /// Submit up to `count` workers, stopping at the first failure.
    async fn submit(&self, backends: &Backends, count: u32, kind: ScaleActionKind) -> ScalerResult<Vec<String>> {
        let mut job_ids = Vec::with_capacity(count as usize);
        let mut failure = None;
        for _ in 0..count {
            match backends.batch.submit_worker().await {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let submitted = job_ids.len() as u32;
        if submitted > 0 {
            let mut state = self.state.lock().await;
            state.metrics.last_scale_action = Some(ScaleAction {
                timestamp: Utc::now(),
                kind,
                count: submitted,
            });
            state.metrics.total_jobs_submitted += u64::from(submitted);
            state.metrics.batch_jobs_pending += submitted;
            state.last_action_at = Some(Instant::now());
            metrics::record_submitted(kind.as_str(), submitted);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(job_ids),
        }
    }

    async fn cooldown_remaining(&self) -> Option<Duration> {
        let at = self.state.lock().await.last_action_at?;
        self.config
            .cooldown
            .checked_sub(at.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    /// Human-readable snapshot for `/scaling/status`.
    pub async fn status_summary(&self) -> String {
        let m = self.metrics().await;
        let mut lines = vec![
            format!("Autoscaling: {}", if m.enabled { "enabled" } else { "disabled" }),
            format!("Queue depth: {}", m.queue_depth),
            format!("Active consumers: {}", m.active_consumers),
            format!(
                "Batch workers: {} running, {} pending",
                m.batch_jobs_running, m.batch_jobs_pending
            ),
            format!("Total jobs submitted: {}", m.total_jobs_submitted),
        ];
        match &m.last_scale_action {
            Some(action) => lines.push(format!(
                "Last scale action: {} {} worker(s) at {}",
                action.kind.as_str(),
                action.count,
                action.timestamp.to_rfc3339()
            )),
            None => lines.push("Last scale action: none".to_string()),
        }
        if let Some(checked) = m.last_checked {
            lines.push(format!("Last checked: {}", checked.to_rfc3339()));
        }
        if let Some(error) = &m.last_error {
            lines.push(format!("Last error: {}", error));
        }
        lines.join("\n")
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.is_enabled() {
            info!("Autoscaling disabled, poll loop not started");
            return;
        }

        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            max_workers = self.config.max_workers,
            "Starting scaling loop"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scaling loop stopped");
    }
}
