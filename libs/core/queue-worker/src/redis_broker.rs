//! Redis Streams broker.
//!
//! Layout per queue:
//! - `<queue>`: live messages
//! - `<queue>:dlq`: dead-lettered messages
//!
//! Each entry stores the JSON [`Envelope`] under the `envelope` field. One consumer
//! group per stream provides the lease: a pending entry owned by this consumer is a
//! locked message, its idle time is the lease age and its delivery counter is the
//! delivery count. Entries idle longer than the lock duration are reclaimed with
//! `XCLAIM`, which also increments the delivery counter.
//!
//! Settlement and renewal run as Lua scripts that re-check ownership (consumer and
//! delivery count) and act in one step, so a competing reclaim cannot slip in between.

use crate::broker::{MessageSender, QueueBroker, QueueRuntimeProperties, SenderFactory};
use crate::envelope::{Envelope, OutgoingMessage, ReceivedMessage, SubQueue};
use crate::error::WorkerError;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script, ScriptInvocation};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENVELOPE_FIELD: &str = "envelope";

type StreamEntries = Vec<(String, Vec<(String, String)>)>;
type StreamReadReply = Vec<(String, StreamEntries)>;
/// (entry id, consumer, idle ms, delivery count)
type PendingEntries = Vec<(String, String, u64, u64)>;

// Shared prologue. KEYS[1] stream; ARGV[1] group, ARGV[2] consumer, ARGV[3] entry id,
// ARGV[4] delivery count the message was received with. Returns 0 when the lease is gone.
macro_rules! owned_script {
    ($body:literal) => {
        concat!(
            "local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)\n",
            "if #p == 0 or p[1][2] ~= ARGV[2] or p[1][4] ~= tonumber(ARGV[4]) then return 0 end\n",
            $body,
            "\nreturn 1\n"
        )
    };
}

const COMPLETE_LUA: &str = owned_script!(
    "redis.call('XACK', KEYS[1], ARGV[1], ARGV[3])
redis.call('XDEL', KEYS[1], ARGV[3])"
);

/// ARGV[5] idle ms; ages the entry so the next receive reclaims it
const ABANDON_LUA: &str = owned_script!(
    "redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'IDLE', ARGV[5], 'JUSTID')"
);

/// Resets idle time; JUSTID leaves the delivery counter alone
const RENEW_LUA: &str =
    owned_script!("redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')");

/// KEYS[2] DLQ stream; ARGV[5] max length, ARGV[6] field, ARGV[7] envelope JSON
const DEAD_LETTER_LUA: &str = owned_script!(
    "redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[5], '*', ARGV[6], ARGV[7])
redis.call('XACK', KEYS[1], ARGV[1], ARGV[3])
redis.call('XDEL', KEYS[1], ARGV[3])"
);

static COMPLETE_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(COMPLETE_LUA));
static ABANDON_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(ABANDON_LUA));
static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(RENEW_LUA));
static DEAD_LETTER_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(DEAD_LETTER_LUA));

/// Consumer-group settings for the Redis broker
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub consumer_group: String,
    pub consumer_id: String,
    pub lock_duration: Duration,
    /// Approximate MAXLEN applied on every XADD
    pub max_stream_length: i64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "queue_workers".to_string(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            lock_duration: Duration::from_secs(60),
            max_stream_length: 100_000,
        }
    }
}

impl RedisBrokerConfig {
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }
}

/// Peek-lock broker on Redis Streams consumer groups
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
    config: RedisBrokerConfig,
    ready_streams: Arc<Mutex<HashSet<String>>>,
}

impl RedisBroker {
    pub fn new(redis: ConnectionManager, config: RedisBrokerConfig) -> Self {
        Self {
            redis,
            config,
            ready_streams: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open a managed connection and verify it with PING
    pub async fn connect(url: &str, config: RedisBrokerConfig) -> Result<Self, WorkerError> {
        let client = redis::Client::open(url)?;
        let mut redis = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut redis).await?;
        info!(
            consumer_group = %config.consumer_group,
            consumer_id = %config.consumer_id,
            "Connected to Redis"
        );
        Ok(Self::new(redis, config))
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }

    fn stream_key(queue: &str, sub_queue: SubQueue) -> String {
        match sub_queue {
            SubQueue::Active => queue.to_string(),
            SubQueue::DeadLetter => format!("{queue}:dlq"),
        }
    }

    fn lock_ms(&self) -> u64 {
        self.config.lock_duration.as_millis() as u64
    }

    /// Create the consumer group once per stream, ignoring BUSYGROUP
    async fn ensure_group(&self, stream: &str) -> Result<(), WorkerError> {
        let mut ready = self.ready_streams.lock().await;
        if ready.contains(stream) {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!(stream = %stream, group = %self.config.consumer_group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        ready.insert(stream.to_string());
        Ok(())
    }

    /// Claim entries whose lease expired or that were abandoned
    async fn reclaim(
        &self,
        stream: &str,
        max: usize,
    ) -> Result<Vec<(String, Vec<(String, String)>, u64)>, WorkerError> {
        let mut conn = self.redis.clone();
        let pending: RedisResult<PendingEntries> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.lock_ms())
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => {
                self.ready_streams.lock().await.remove(stream);
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };

        let mut claimed = Vec::new();
        for (id, _owner, _idle, count) in pending {
            // min-idle-time makes the claim exclusive among competing consumers
            let entries: StreamEntries = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(&self.config.consumer_group)
                .arg(&self.config.consumer_id)
                .arg(self.lock_ms())
                .arg(&id)
                .query_async(&mut conn)
                .await?;

            for (entry_id, fields) in entries {
                claimed.push((entry_id, fields, count + 1));
            }
        }

        if !claimed.is_empty() {
            warn!(stream = %stream, count = claimed.len(), "Reclaimed expired or abandoned messages");
        }
        Ok(claimed)
    }

    async fn read_new(
        &self,
        stream: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<StreamEntries, WorkerError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block.filter(|b| !b.is_zero()) {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let result: RedisResult<Option<StreamReadReply>> = cmd.query_async(&mut conn).await;
        match result {
            Ok(Some(streams)) => Ok(streams.into_iter().flat_map(|(_, entries)| entries).collect()),
            Ok(None) => Ok(vec![]),
            Err(e) if e.to_string().contains("NOGROUP") => {
                self.ready_streams.lock().await.remove(stream);
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }

    fn to_received(
        &self,
        queue: &str,
        sub_queue: SubQueue,
        entry_id: String,
        fields: Vec<(String, String)>,
        delivery_count: u64,
    ) -> ReceivedMessage {
        let raw = fields
            .into_iter()
            .find(|(k, _)| k == ENVELOPE_FIELD)
            .map(|(_, v)| v)
            .unwrap_or_default();

        // A corrupt entry still goes through the consumer so it ends up dead-lettered
        let mut envelope = serde_json::from_str::<Envelope>(&raw).unwrap_or_else(|e| {
            warn!(entry_id = %entry_id, error = %e, "Stream entry is not a valid envelope");
            OutgoingMessage {
                message_id: entry_id.clone(),
                correlation_id: None,
                subject: None,
                content_type: None,
                body: raw.clone(),
                application_properties: Default::default(),
            }
            .into_envelope(Utc::now())
        });
        envelope.delivery_count = u32::try_from(delivery_count).unwrap_or(u32::MAX);

        let lease = chrono::Duration::from_std(self.config.lock_duration)
            .unwrap_or(chrono::Duration::zero());

        ReceivedMessage {
            envelope,
            lock_token: entry_id,
            locked_until: Utc::now() + lease,
            queue_name: queue.to_string(),
            sub_queue,
        }
    }

    /// Invocation with the ownership prologue's keys and arguments filled in
    fn owned_invocation<'a>(
        &self,
        script: &'a Script,
        message: &ReceivedMessage,
    ) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(Self::stream_key(&message.queue_name, message.sub_queue))
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(&message.lock_token)
            .arg(message.delivery_count());
        invocation
    }

    /// Run an ownership-checked script; 0 means another consumer holds the entry
    async fn run_owned(
        &self,
        invocation: &ScriptInvocation<'_>,
        message: &ReceivedMessage,
    ) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let owned: i64 = invocation.invoke_async(&mut conn).await?;
        lease_outcome(owned, message)
    }
}

fn lease_outcome(owned: i64, message: &ReceivedMessage) -> Result<(), WorkerError> {
    if owned == 1 {
        Ok(())
    } else {
        Err(WorkerError::LockLost {
            message_id: message.envelope.message_id.clone(),
        })
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn receive(
        &self,
        queue: &str,
        sub_queue: SubQueue,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, WorkerError> {
        let stream = Self::stream_key(queue, sub_queue);
        self.ensure_group(&stream).await?;

        let mut received: Vec<ReceivedMessage> = self
            .reclaim(&stream, max_messages)
            .await?
            .into_iter()
            .map(|(id, fields, count)| self.to_received(queue, sub_queue, id, fields, count))
            .collect();

        let remaining = max_messages.saturating_sub(received.len());
        if remaining > 0 {
            let block = received.is_empty().then_some(max_wait);
            let fresh = self.read_new(&stream, remaining, block).await?;
            received.extend(
                fresh
                    .into_iter()
                    .map(|(id, fields)| self.to_received(queue, sub_queue, id, fields, 1)),
            );
        }

        Ok(received)
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        let invocation = self.owned_invocation(&COMPLETE_SCRIPT, message);
        self.run_owned(&invocation, message).await?;

        debug!(message_id = %message.message_id(), "Completed message");
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        let mut invocation = self.owned_invocation(&ABANDON_SCRIPT, message);
        invocation.arg(self.lock_ms());
        self.run_owned(&invocation, message).await?;

        debug!(message_id = %message.message_id(), "Abandoned message");
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), WorkerError> {
        let dlq = Self::stream_key(&message.queue_name, SubQueue::DeadLetter);

        let mut envelope = message.envelope.clone();
        envelope.dead_letter_reason = Some(reason.to_string());
        envelope.dead_letter_error_description = Some(description.to_string());
        let data = serde_json::to_string(&envelope)?;

        let mut invocation = self.owned_invocation(&DEAD_LETTER_SCRIPT, message);
        invocation
            .key(&dlq)
            .arg(self.config.max_stream_length)
            .arg(ENVELOPE_FIELD)
            .arg(&data);
        self.run_owned(&invocation, message).await?;

        debug!(message_id = %message.message_id(), dlq = %dlq, "Dead-lettered message");
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        let invocation = self.owned_invocation(&RENEW_SCRIPT, message);
        self.run_owned(&invocation, message).await
    }

    async fn runtime_properties(
        &self,
        queue: &str,
    ) -> Result<QueueRuntimeProperties, WorkerError> {
        let mut conn = self.redis.clone();
        let (active, dead): (u64, u64) = redis::pipe()
            .cmd("XLEN")
            .arg(Self::stream_key(queue, SubQueue::Active))
            .cmd("XLEN")
            .arg(Self::stream_key(queue, SubQueue::DeadLetter))
            .query_async(&mut conn)
            .await?;

        Ok(QueueRuntimeProperties {
            active_count: active,
            dead_letter_count: dead,
            total_count: active + dead,
        })
    }

    fn lock_duration(&self) -> Duration {
        self.config.lock_duration
    }
}

/// XADD producer for one stream
pub struct RedisSender {
    redis: ConnectionManager,
    stream: String,
    max_length: i64,
}

#[async_trait]
impl MessageSender for RedisSender {
    fn destination(&self) -> &str {
        &self.stream
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), WorkerError> {
        let message_id = message.message_id.clone();
        let data = serde_json::to_string(&message.into_envelope(Utc::now()))?;
        let mut conn = self.redis.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(&data)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %self.stream, message_id = %message_id, entry_id = %entry_id, "Sent message");
        Ok(())
    }
}

#[async_trait]
impl SenderFactory for RedisBroker {
    async fn create_sender(&self, destination: &str) -> Result<Arc<dyn MessageSender>, WorkerError> {
        Ok(Arc::new(RedisSender {
            redis: self.redis.clone(),
            stream: Self::stream_key(destination, SubQueue::Active),
            max_length: self.config.max_stream_length,
        }))
    }
}
