//! Job executor: consume loop, stale claims, idle exit and shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vpipe_queue::{Delivery, JobQueue, QueueConfig};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::processor::{Disposition, JobProcessor};
use crate::retry::{retry_async, FailureTracker};
use crate::settle::DeliverySettler;

/// Why the executor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A shutdown signal arrived
    Shutdown,
    /// Idle-exit conditions held
    Idle,
}

/// Connect to the broker, backing off between failed attempts.
pub async fn connect_queue(config: &WorkerConfig, queue_config: QueueConfig) -> WorkerResult<JobQueue> {
    let policy = config.reconnect_policy();
    retry_async(&policy, |_| JobQueue::connect(queue_config.clone()))
        .await
        .map_err(|(e, attempts)| WorkerError::ReconnectExhausted {
            attempts,
            message: e.to_string(),
        })
}

/// Time since the last finished job.
struct Activity {
    started: Instant,
    last_finished_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_finished_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_finished_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    fn since_last(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_finished_ms.load(Ordering::SeqCst)))
    }
}

/// Whether an idle worker should exit.
pub fn idle_exit_due(in_flight: usize, since_last_job: Duration, idle_timeout: Duration, queue_depth: u64) -> bool {
    in_flight == 0 && since_last_job >= idle_timeout && queue_depth == 0
}

/// Limits a delivery is checked against before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryLimits {
    pub max_deliveries: u32,
    pub message_ttl: Duration,
}

impl DeliveryLimits {
    pub fn from_queue(config: &QueueConfig) -> Self {
        Self {
            max_deliveries: config.max_deliveries,
            message_ttl: config.message_ttl,
        }
    }
}

/// Settles one delivery; shared by the consume loop and the claim task.
///
/// Every delivery handed to [`DeliveryHandler::handle`] is settled exactly
/// once, by ack or reject.
#[derive(Clone)]
pub struct DeliveryHandler {
    settler: Arc<dyn DeliverySettler>,
    processor: Arc<JobProcessor>,
    limits: DeliveryLimits,
    activity: Arc<Activity>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DeliveryHandler {
    pub fn new(settler: Arc<dyn DeliverySettler>, processor: Arc<JobProcessor>, limits: DeliveryLimits) -> Self {
        Self {
            settler,
            processor,
            limits,
            activity: Arc::new(Activity::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Message IDs currently being handled.
    pub async fn in_flight(&self) -> HashSet<String> {
        self.in_flight.lock().await.clone()
    }

    pub async fn handle(&self, delivery: Delivery) {
        self.in_flight.lock().await.insert(delivery.message_id.clone());
        self.settle(&delivery).await;
        self.in_flight.lock().await.remove(&delivery.message_id);
        self.activity.touch();
    }

    async fn settle(&self, delivery: &Delivery) {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let expired = delivery.expiry_reason(self.limits.max_deliveries, self.limits.message_ttl, now_ms);

        if let Some(reason) = expired {
            if let Ok(job) = delivery.parse() {
                self.processor.abandon(&job.video_id, &reason).await;
            }
            self.reject(delivery, &reason).await;
            metrics::record_rejected("expired");
            return;
        }

        let job = match delivery.parse() {
            Ok(job) => job,
            Err(reason) => {
                self.reject(delivery, &format!("invalid payload: {}", reason)).await;
                metrics::record_rejected("invalid");
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.processor.process(&job).await;
        metrics::record_job(outcome.label(), started.elapsed().as_secs_f64());

        match outcome.disposition() {
            Disposition::Ack => {
                if let Err(e) = self.settler.ack(&delivery.message_id).await {
                    error!(video_id = %job.video_id, "Failed to ack message {}: {}", delivery.message_id, e);
                }
            }
            Disposition::DeadLetter(reason) => self.reject(delivery, &reason).await,
        }
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) {
        if let Err(e) = self.settler.reject(delivery, reason).await {
            error!("Failed to reject message {}: {}", delivery.message_id, e);
        }
    }
}

/// Job executor that processes jobs from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    handler: DeliveryHandler,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: JobQueue, processor: JobProcessor) -> Self {
        let queue = Arc::new(queue);
        let job_semaphore = Arc::new(Semaphore::new(config.prefetch.max(1)));
        let (shutdown, _) = watch::channel(false);
        let handler = DeliveryHandler::new(
            Arc::clone(&queue) as Arc<dyn DeliverySettler>,
            Arc::new(processor),
            DeliveryLimits::from_queue(queue.config()),
        );

        Self {
            config,
            queue,
            handler,
            job_semaphore,
            shutdown,
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn prefetch(&self) -> usize {
        self.config.prefetch.max(1)
    }

    fn in_flight(&self) -> usize {
        self.prefetch() - self.job_semaphore.available_permits()
    }

    /// Run until shutdown or idle exit.
    ///
    /// Errors are fatal: topology could not be declared or reconnects were
    /// exhausted.
    pub async fn run(&self) -> WorkerResult<ExitReason> {
        let topology = self.queue.declare_topology().await?;
        info!(
            consumer = %self.config.consumer_name,
            prefetch = self.prefetch(),
            topology = %topology,
            idle_exit = self.config.idle_exit,
            "Starting job executor"
        );

        let claim_task = self.spawn_claim_task();
        let result = self.consume_loop().await;

        self.shutdown();
        if let Err(e) = claim_task.await {
            warn!("Claim task ended abnormally: {}", e);
        }

        let reason = result?;
        self.drain().await;
        Ok(reason)
    }

    async fn consume_loop(&self) -> WorkerResult<ExitReason> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut last_idle_check = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping consumption");
                return Ok(ExitReason::Shutdown);
            }

            if self.config.idle_exit && last_idle_check.elapsed() >= self.config.idle_check_interval {
                last_idle_check = Instant::now();
                if self.idle_exit_due().await {
                    info!(
                        idle_secs = self.handler.activity.since_last().as_secs(),
                        "Worker idle and queue empty, exiting"
                    );
                    return Ok(ExitReason::Idle);
                }
            }

            let permits = take_permits(&self.job_semaphore, self.prefetch());
            if permits.is_empty() {
                // All slots busy
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            }

            // Reads are never cancelled mid-flight, so every delivery received is settled
            match self.queue.consume(&self.config.consumer_name, permits.len()).await {
                Ok(deliveries) => {
                    if !deliveries.is_empty() {
                        debug!("Consumed {} messages", deliveries.len());
                    }
                    self.dispatch(deliveries, permits);
                }
                Err(e) if e.is_connection_error() => {
                    drop(permits);
                    warn!("Lost broker connection: {}", e);
                    self.reconnect().await?;
                }
                Err(e) => {
                    drop(permits);
                    error!("Error consuming jobs: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn dispatch(&self, deliveries: Vec<Delivery>, permits: Vec<OwnedSemaphorePermit>) {
        for (delivery, permit) in deliveries.into_iter().zip(permits) {
            let handler = self.handler.clone();
            let semaphore = Arc::clone(&self.job_semaphore);
            let prefetch = self.prefetch();
            tokio::spawn(async move {
                handler.handle(delivery).await;
                drop(permit);
                metrics::set_in_flight(prefetch - semaphore.available_permits());
            });
        }
        metrics::set_in_flight(self.in_flight());
    }

    /// Reconnect and redeclare the topology with exponential backoff.
    async fn reconnect(&self) -> WorkerResult<()> {
        let policy = self.config.reconnect_policy();
        let queue = &self.queue;
        retry_async(&policy, |_| async move {
            metrics::record_reconnect();
            queue.reconnect().await?;
            queue.declare_topology().await
        })
        .await
        .map(|_| ())
        .map_err(|(e, attempts)| {
            error!(attempts, "Giving up on broker reconnect: {}", e);
            WorkerError::ReconnectExhausted {
                attempts,
                message: e.to_string(),
            }
        })
    }

    async fn idle_exit_due(&self) -> bool {
        let since_last = self.handler.activity.since_last();
        let in_flight = self.in_flight();
        if in_flight > 0 || since_last < self.config.idle_timeout {
            return false;
        }
        match self.queue.stats().await {
            Ok(stats) => idle_exit_due(in_flight, since_last, self.config.idle_timeout, stats.depth),
            Err(e) => {
                warn!("Idle check could not read queue depth: {}", e);
                false
            }
        }
    }

    /// Periodically claim deliveries abandoned by crashed consumers, or left
    /// unsettled by this one.
    fn spawn_claim_task(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let handler = self.handler.clone();
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer = self.config.consumer_name.clone();
        let prefetch = self.prefetch();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.claim_interval);

        tokio::spawn(async move {
            let mut failures = FailureTracker::new(3);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let permits = take_permits(&semaphore, prefetch);
                        if permits.is_empty() {
                            continue;
                        }
                        let in_flight = handler.in_flight().await;
                        match queue.claim_stale(&consumer, permits.len(), &in_flight).await {
                            Ok(deliveries) => {
                                failures.record_success();
                                for (delivery, permit) in deliveries.into_iter().zip(permits) {
                                    let handler = handler.clone();
                                    tokio::spawn(async move {
                                        handler.handle(delivery).await;
                                        drop(permit);
                                    });
                                }
                            }
                            Err(e) => {
                                if failures.record_failure() {
                                    warn!("Failed to claim stale deliveries: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Wait for in-flight jobs, then leave the consumer group.
    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs to complete");
        }

        let all_permits = self.prefetch() as u32;
        let waited = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.job_semaphore.acquire_many(all_permits),
        )
        .await;

        match waited {
            Ok(Ok(_permits)) => {
                // Kept registered while it still holds unsettled entries
                if let Err(e) = self.queue.remove_consumer(&self.config.consumer_name).await {
                    warn!("Failed to remove consumer: {}", e);
                }
            }
            // Unsettled deliveries stay pending so another worker can claim them
            _ => warn!(
                in_flight = self.in_flight(),
                "Shutdown timeout reached with jobs in flight, leaving consumer registered"
            ),
        }

        info!("Job executor stopped");
    }
}

/// Take up to `max` free permits without waiting.
fn take_permits(semaphore: &Arc<Semaphore>, max: usize) -> Vec<OwnedSemaphorePermit> {
    let mut permits = Vec::with_capacity(max);
    while permits.len() < max {
        match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => permits.push(permit),
            Err(_) => break,
        }
    }
    permits
}
