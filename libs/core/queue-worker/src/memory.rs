//! In-process broker with peek-lock semantics.
//!
//! Used by tests and local runs. Lock expiry is measured with `tokio::time`, so
//! paused-clock tests can drive lease lapses deterministically.

use crate::broker::{MessageSender, QueueBroker, QueueRuntimeProperties, SenderFactory};
use crate::envelope::{Envelope, OutgoingMessage, ReceivedMessage, SubQueue};
use crate::error::WorkerError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct Lock {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Stored {
    envelope: Envelope,
    lock: Option<Lock>,
}

impl Stored {
    fn is_available(&self, now: Instant) -> bool {
        self.lock.as_ref().is_none_or(|lock| lock.expires_at <= now)
    }

    fn is_locked_by(&self, token: &str, now: Instant) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| lock.token == token && lock.expires_at > now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    active: Vec<Stored>,
    dead_letter: Vec<Stored>,
}

impl QueueState {
    fn sub_queue(&mut self, sub_queue: SubQueue) -> &mut Vec<Stored> {
        match sub_queue {
            SubQueue::Active => &mut self.active,
            SubQueue::DeadLetter => &mut self.dead_letter,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    failing_destinations: HashSet<String>,
}

/// Peek-lock broker held entirely in memory
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    arrivals: Arc<Notify>,
    lock_duration: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryBroker {
    pub fn new(lock_duration: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            arrivals: Arc::new(Notify::new()),
            lock_duration,
        }
    }

    /// Put a message on the live queue
    pub async fn enqueue(&self, queue: &str, message: OutgoingMessage) {
        self.push(queue, SubQueue::Active, message.into_envelope(Utc::now()));
    }

    /// Put an already dead-lettered envelope on the queue's DLQ
    pub fn insert_dead_letter(&self, queue: &str, envelope: Envelope) {
        self.push(queue, SubQueue::DeadLetter, envelope);
    }

    /// Snapshot of the envelopes in a sub-queue, in arrival order
    pub fn messages(&self, queue: &str, sub_queue: SubQueue) -> Vec<Envelope> {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .sub_queue(sub_queue)
            .iter()
            .map(|stored| stored.envelope.clone())
            .collect()
    }

    /// Make sends to `destination` fail (or succeed again)
    pub fn fail_sends_to(&self, destination: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_destinations.insert(destination.to_string());
        } else {
            state.failing_destinations.remove(destination);
        }
    }

    fn push(&self, queue: &str, sub_queue: SubQueue, envelope: Envelope) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .sub_queue(sub_queue)
            .push(Stored {
                envelope,
                lock: None,
            });
        self.arrivals.notify_waiters();
    }

    fn try_receive(&self, queue: &str, sub_queue: SubQueue, max: usize) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let lock_duration = self.lock_duration;
        let locked_until = Utc::now()
            + chrono::Duration::from_std(lock_duration).unwrap_or(chrono::Duration::zero());

        let mut state = self.lock();
        let messages = state.queues.entry(queue.to_string()).or_default().sub_queue(sub_queue);

        messages
            .iter_mut()
            .filter(|stored| stored.is_available(now))
            .take(max)
            .map(|stored| {
                let token = Uuid::new_v4().to_string();
                stored.lock = Some(Lock {
                    token: token.clone(),
                    expires_at: now + lock_duration,
                });
                stored.envelope.delivery_count += 1;
                ReceivedMessage {
                    envelope: stored.envelope.clone(),
                    lock_token: token,
                    locked_until,
                    queue_name: queue.to_string(),
                    sub_queue,
                }
            })
            .collect()
    }

    /// Run `f` on the stored message if `message`'s lock still owns it
    fn with_owned<T>(
        &self,
        message: &ReceivedMessage,
        f: impl FnOnce(&mut Vec<Stored>, usize) -> T,
    ) -> Result<T, WorkerError> {
        let now = Instant::now();
        let mut state = self.lock();
        let messages = state
            .queues
            .entry(message.queue_name.clone())
            .or_default()
            .sub_queue(message.sub_queue);

        let position = messages
            .iter()
            .position(|stored| {
                stored.envelope.message_id == message.envelope.message_id
                    && stored.is_locked_by(&message.lock_token, now)
            })
            .ok_or_else(|| WorkerError::LockLost {
                message_id: message.envelope.message_id.clone(),
            })?;

        Ok(f(messages, position))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn receive(
        &self,
        queue: &str,
        sub_queue: SubQueue,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, WorkerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.arrivals.notified();
            let received = self.try_receive(queue, sub_queue, max_messages);
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }
            // Wake on new arrivals, or poll again when held locks may have expired
            let poll = Duration::from_millis(100).min(deadline.saturating_duration_since(Instant::now()));
            let _ = tokio::time::timeout(poll, notified).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        self.with_owned(message, |messages, position| {
            messages.remove(position);
        })
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        self.with_owned(message, |messages, position| {
            messages[position].lock = None;
        })?;
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), WorkerError> {
        let mut envelope = self.with_owned(message, |messages, position| {
            messages.remove(position).envelope
        })?;
        envelope.dead_letter_reason = Some(reason.to_string());
        envelope.dead_letter_error_description = Some(description.to_string());
        self.push(&message.queue_name, SubQueue::DeadLetter, envelope);
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<(), WorkerError> {
        let expires_at = Instant::now() + self.lock_duration;
        self.with_owned(message, |messages, position| {
            if let Some(lock) = messages[position].lock.as_mut() {
                lock.expires_at = expires_at;
            }
        })
    }

    async fn runtime_properties(
        &self,
        queue: &str,
    ) -> Result<QueueRuntimeProperties, WorkerError> {
        let mut state = self.lock();
        let queue = state.queues.entry(queue.to_string()).or_default();
        let active_count = queue.active.len() as u64;
        let dead_letter_count = queue.dead_letter.len() as u64;
        Ok(QueueRuntimeProperties {
            active_count,
            dead_letter_count,
            total_count: active_count + dead_letter_count,
        })
    }

    fn lock_duration(&self) -> Duration {
        self.lock_duration
    }
}

/// Sender that enqueues onto an [`InMemoryBroker`] queue
pub struct InMemorySender {
    broker: InMemoryBroker,
    destination: String,
}

#[async_trait]
impl MessageSender for InMemorySender {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), WorkerError> {
        if self.broker.lock().failing_destinations.contains(&self.destination) {
            return Err(WorkerError::transient(format!(
                "send to '{}' failed",
                self.destination
            )));
        }
        self.broker.enqueue(&self.destination, message).await;
        Ok(())
    }
}

#[async_trait]
impl SenderFactory for InMemoryBroker {
    async fn create_sender(&self, destination: &str) -> Result<Arc<dyn MessageSender>, WorkerError> {
        Ok(Arc::new(InMemorySender {
            broker: self.clone(),
            destination: destination.to_string(),
        }))
    }
}
