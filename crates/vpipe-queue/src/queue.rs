//! Job queue using Redis Streams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamInfoConsumersReply, StreamInfoGroupsReply, StreamPendingCountReply,
    StreamReadReply,
};
use redis::{AsyncCommands, AsyncConnectionConfig};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vpipe_models::TranscodeJob;

use crate::delivery::{Delivery, JOB_FIELD};
use crate::error::{QueueError, QueueResult};
use crate::topology::{args_key, compare_args, Topology};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter stream name
    pub dlq_stream_name: String,
    /// Inspection group on the dead letter stream
    pub dlq_group: String,
    /// Deliveries before a message is dead-lettered
    pub max_deliveries: u32,
    /// Age after which a message is dead-lettered
    pub message_ttl: Duration,
    /// Idle time before another consumer's delivery is reclaimed
    pub claim_min_idle: Duration,
    /// Consumers idle for less than this count as active
    pub consumer_active_window: Duration,
    /// XREADGROUP block time
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vpipe:transcode".to_string(),
            consumer_group: "vpipe:transcoders".to_string(),
            dlq_stream_name: "vpipe:transcode:dlq".to_string(),
            dlq_group: "vpipe:dlq-inspectors".to_string(),
            max_deliveries: 3,
            message_ttl: Duration::from_secs(24 * 3600),
            claim_min_idle: Duration::from_secs(1800),
            consumer_active_window: Duration::from_secs(300),
            block_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
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
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            dlq_group: std::env::var("QUEUE_DLQ_GROUP").unwrap_or(defaults.dlq_group),
            max_deliveries: std::env::var("QUEUE_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_deliveries),
            message_ttl: secs("QUEUE_MESSAGE_TTL", defaults.message_ttl),
            claim_min_idle: secs("QUEUE_CLAIM_MIN_IDLE_SECS", defaults.claim_min_idle),
            consumer_active_window: secs("QUEUE_CONSUMER_ACTIVE_SECS", defaults.consumer_active_window),
            block_timeout: secs("QUEUE_BLOCK_SECS", defaults.block_timeout),
        }
    }

    /// Environment variables that reproduce this configuration through
    /// [`QueueConfig::from_env`].
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("REDIS_URL", self.redis_url.clone()),
            ("QUEUE_STREAM", self.stream_name.clone()),
            ("QUEUE_CONSUMER_GROUP", self.consumer_group.clone()),
            ("QUEUE_DLQ_STREAM", self.dlq_stream_name.clone()),
            ("QUEUE_DLQ_GROUP", self.dlq_group.clone()),
            ("QUEUE_MAX_DELIVERIES", self.max_deliveries.to_string()),
            ("QUEUE_MESSAGE_TTL", self.message_ttl.as_secs().to_string()),
            ("QUEUE_CLAIM_MIN_IDLE_SECS", self.claim_min_idle.as_secs().to_string()),
            ("QUEUE_CONSUMER_ACTIVE_SECS", self.consumer_active_window.as_secs().to_string()),
            ("QUEUE_BLOCK_SECS", self.block_timeout.as_secs().to_string()),
        ]
    }

    /// Arguments recorded in the topology hash.
    fn declared_args(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dead_letter_stream", self.dlq_stream_name.clone()),
            ("max_deliveries", self.max_deliveries.to_string()),
            ("message_ttl_secs", self.message_ttl.as_secs().to_string()),
        ]
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages not yet delivered to any consumer
    pub depth: u64,
    /// Delivered but unacknowledged messages
    pub pending: u64,
    /// Consumers that interacted within the active window
    pub consumers: u32,
    /// Messages in the dead letter stream
    pub dlq_depth: u64,
}

struct Connections {
    /// Commands that answer immediately
    command: MultiplexedConnection,
    /// Blocking reads, so they never stall acks
    reader: MultiplexedConnection,
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
    connections: RwLock<Connections>,
    dead_letter: AtomicBool,
}

impl JobQueue {
    /// Connect and verify the connection with PING.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let connections = open_connections(&client, &config).await?;
        info!(stream = %config.stream_name, "Connected to Redis");
        Ok(Self {
            client,
            config,
            connections: RwLock::new(connections),
            dead_letter: AtomicBool::new(false),
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(QueueConfig::from_env()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Whether rejected messages go to the dead letter stream.
    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter.load(Ordering::SeqCst)
    }

    /// Replace both connections with fresh, PING-verified ones.
    pub async fn reconnect(&self) -> QueueResult<()> {
        let fresh = open_connections(&self.client, &self.config).await?;
        *self.connections.write().await = fresh;
        info!("Reconnected to Redis");
        Ok(())
    }

    async fn conn(&self) -> MultiplexedConnection {
        self.connections.read().await.command.clone()
    }

    async fn reader(&self) -> MultiplexedConnection {
        self.connections.read().await.reader.clone()
    }

    /// Declare the queue topology.
    ///
    /// Tries the dead-lettered topology first and falls back to a plain
    /// consumer group, in which case dead-lettering is disabled.
    pub async fn declare_topology(&self) -> QueueResult<Topology> {
        let topology = match self.declare_dead_lettered().await {
            Ok(()) => Topology::DeadLettered,
            Err(e) => {
                warn!(
                    stream = %self.config.stream_name,
                    "Dead-lettered topology unavailable, falling back to plain queue: {}", e
                );
                self.declare_plain().await?;
                Topology::Plain
            }
        };

        self.dead_letter
            .store(topology.dead_letter_enabled(), Ordering::SeqCst);
        info!(stream = %self.config.stream_name, topology = %topology, "Queue topology declared");
        Ok(topology)
    }

    async fn declare_dead_lettered(&self) -> QueueResult<()> {
        let mut conn = self.conn().await;
        let key = args_key(&self.config.stream_name);
        let requested = self.config.declared_args();

        let existing: HashMap<String, String> = conn.hgetall(&key).await?;
        if let Some(details) = compare_args(&existing, &requested) {
            return Err(QueueError::IncompatibleArguments {
                stream: self.config.stream_name.clone(),
                details,
            });
        }
        if existing.is_empty() {
            conn.hset_multiple::<_, _, _, ()>(&key, &requested).await?;
        }

        self.create_group(&self.config.stream_name, &self.config.consumer_group)
            .await?;
        self.create_group(&self.config.dlq_stream_name, &self.config.dlq_group)
            .await?;
        Ok(())
    }

    async fn declare_plain(&self) -> QueueResult<()> {
        self.create_group(&self.config.stream_name, &self.config.consumer_group)
            .await
    }

    /// Create a consumer group (ignore error if it already exists).
    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<()> {
        let mut conn = self.conn().await;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!("Created consumer group {} on {}", group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {} on {}", group, stream);
            }
            Err(e) if e.to_string().contains("WRONGTYPE") => {
                return Err(QueueError::topology(format!("{} is not a stream: {}", stream, e)));
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }
        Ok(())
    }

    /// Enqueue a transcode job.
    pub async fn enqueue(&self, job: &TranscodeJob) -> QueueResult<String> {
        job.validate()
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;
        let payload = serde_json::to_string(job)?;

        let mut conn = self.conn().await;
        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        info!(video_id = %job.video_id, "Enqueued transcode job with message ID {}", message_id);
        Ok(message_id)
    }

    /// Read up to `count` new messages for `consumer`.
    pub async fn consume(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.reader().await;
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.config.block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let deliveries: Vec<Delivery> = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|entry| to_delivery(entry.id, &entry.map, 1))
            .collect();

        if !deliveries.is_empty() {
            debug!(consumer, count = deliveries.len(), "Consumed messages");
        }
        Ok(deliveries)
    }

    /// Claim deliveries held longer than the idle window.
    ///
    /// Covers jobs from crashed workers and entries of this consumer whose
    /// read reply or settlement was lost. IDs in `in_flight` are being
    /// processed here and are skipped. The returned delivery counts include
    /// this claim.
    pub async fn claim_stale(
        &self,
        consumer: &str,
        count: usize,
        in_flight: &HashSet<String>,
    ) -> QueueResult<Vec<Delivery>> {
        let min_idle_ms = self.config.claim_min_idle.as_millis() as u64;
        let mut conn = self.conn().await;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count + in_flight.len())
            .query_async(&mut conn)
            .await?;

        let stale: Vec<_> = pending
            .ids
            .iter()
            .filter(|p| !in_flight.contains(&p.id))
            .take(count)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let times_delivered: HashMap<String, u32> = stale
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered as u32))
            .collect();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for p in &stale {
            cmd.arg(&p.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries: Vec<Delivery> = claimed
            .ids
            .into_iter()
            .map(|entry| {
                let previous = times_delivered.get(&entry.id).copied().unwrap_or(0);
                to_delivery(entry.id, &entry.map, previous + 1)
            })
            .collect();

        if !deliveries.is_empty() {
            info!(consumer, count = deliveries.len(), "Claimed stale deliveries");
        }
        Ok(deliveries)
    }

    /// Acknowledge a delivery and remove it from the stream.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await;
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Settle a delivery without requeue.
    ///
    /// The message moves to the dead letter stream when the topology supports
    /// it, otherwise it is dropped.
    pub async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        if !self.dead_letter_enabled() {
            self.ack(&delivery.message_id).await?;
            warn!(
                message_id = %delivery.message_id,
                "Dropped message (dead-lettering disabled): {}", reason
            );
            return Ok(());
        }

        let mut conn = self.conn().await;
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(delivery.payload.as_deref().unwrap_or(""))
            .arg("reason")
            .arg(reason)
            .arg("original_id")
            .arg(&delivery.message_id)
            .arg("deliveries")
            .arg(delivery.deliveries)
            .ignore()
            .cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(&delivery.message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        warn!(message_id = %delivery.message_id, "Moved message to DLQ: {}", reason);
        Ok(())
    }

    /// Queue occupancy for scaling and idle checks.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        let dlq_depth: u64 = conn.xlen(&self.config.dlq_stream_name).await?;

        let groups: StreamInfoGroupsReply = match redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.config.stream_name)
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("no such key") => {
                return Ok(QueueStats {
                    dlq_depth,
                    ..Default::default()
                })
            }
            Err(e) => return Err(e.into()),
        };

        let pending = groups
            .groups
            .iter()
            .find(|g| g.name == self.config.consumer_group)
            .map(|g| g.pending as u64);

        let consumers = match pending {
            Some(_) => self.active_consumers(&mut conn).await?,
            None => 0,
        };
        let pending = pending.unwrap_or(0);

        Ok(QueueStats {
            depth: len.saturating_sub(pending),
            pending,
            consumers,
            dlq_depth,
        })
    }

    async fn active_consumers(&self, conn: &mut MultiplexedConnection) -> QueueResult<u32> {
        let reply: StreamInfoConsumersReply = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(conn)
            .await?;

        let window_ms = self.config.consumer_active_window.as_millis() as usize;
        Ok(reply.consumers.iter().filter(|c| c.idle < window_ms).count() as u32)
    }

    /// Entries delivered to `consumer` and not yet acknowledged.
    pub async fn pending_for(&self, consumer: &str) -> QueueResult<usize> {
        let mut conn = self.conn().await;
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(reply.ids.len())
    }

    /// Remove `consumer` from the group on shutdown.
    ///
    /// A consumer still holding pending entries stays registered so those
    /// entries can be claimed by another worker. Returns whether the consumer
    /// was removed.
    pub async fn remove_consumer(&self, consumer: &str) -> QueueResult<bool> {
        if self.pending_for(consumer).await? > 0 {
            warn!(consumer, "Consumer still holds pending messages, leaving it registered");
            return Ok(false);
        }

        let mut conn = self.conn().await;
        let _: i64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;

        info!(consumer, "Removed consumer from group");
        Ok(true)
    }
}

async fn open_connections(client: &redis::Client, config: &QueueConfig) -> QueueResult<Connections> {
    let command = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| QueueError::connection_failed(e.to_string()))?;

    let reader_config =
        AsyncConnectionConfig::new().set_response_timeout(config.block_timeout + Duration::from_secs(5));
    let reader = client
        .get_multiplexed_async_connection_with_config(&reader_config)
        .await
        .map_err(|e| QueueError::connection_failed(e.to_string()))?;

    let mut ping = command.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut ping)
        .await
        .map_err(|e| QueueError::connection_failed(e.to_string()))?;

    Ok(Connections { command, reader })
}

fn to_delivery(id: String, fields: &HashMap<String, redis::Value>, deliveries: u32) -> Delivery {
    let payload = fields
        .get(JOB_FIELD)
        .and_then(|v| redis::from_redis_value::<String>(v).ok());
    Delivery::new(id, payload, deliveries)
}
