//! End-to-end tests for QueueWorker against the in-memory broker
//!
//! These tests verify the settlement rules as the broker sees them:
//! - successful handling completes the message
//! - transient failures are redelivered until the delivery ceiling, then dead-lettered
//! - undecodable and permanently failing messages are dead-lettered on first delivery

use async_trait::async_trait;
use queue_worker::{
    InMemoryBroker, MessageContext, MessageHandler, OutgoingMessage, QueueBroker, QueueJob,
    QueueWorker, SubQueue, WorkerConfig, WorkerError, REASON_INVALID_FORMAT,
    REASON_MAX_DELIVERIES, REASON_PERMANENT_FAILURE,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const QUEUE: &str = "test-queue";

#[derive(Debug, Deserialize)]
struct TestJob {
    id: String,
}

impl QueueJob for TestJob {
    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    FailTransient,
    FailPermanent,
    /// Fail transiently until this delivery count, then succeed
    SucceedOnDelivery(u32),
    Sleep(Duration),
}

struct TestHandler {
    behavior: Behavior,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl TestHandler {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MessageHandler<TestJob> for TestHandler {
    async fn handle(&self, _job: &TestJob, ctx: &MessageContext) -> Result<(), WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailTransient => Err(WorkerError::transient("HTTP 503")),
            Behavior::FailPermanent => Err(WorkerError::permanent("policy not found")),
            Behavior::SucceedOnDelivery(n) if ctx.delivery_count >= n => Ok(()),
            Behavior::SucceedOnDelivery(_) => Err(WorkerError::transient("HTTP 503")),
            Behavior::Sleep(duration) => {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "test_handler"
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new(QUEUE).with_receive_wait(Duration::from_millis(50))
}

fn start(
    broker: &InMemoryBroker,
    handler: Arc<TestHandler>,
    config: WorkerConfig,
) -> (watch::Sender<bool>, JoinHandle<Result<(), WorkerError>>) {
    let (tx, rx) = watch::channel(false);
    let worker = QueueWorker::<TestJob, _>::with_arc_handler(Arc::new(broker.clone()), handler, config);
    let handle = tokio::spawn(async move { worker.run(rx).await });
    (tx, handle)
}

async fn stop(tx: watch::Sender<bool>, handle: JoinHandle<Result<(), WorkerError>>) {
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn enqueue_job(broker: &InMemoryBroker, id: &str) {
    let message = OutgoingMessage::json(&json!({ "id": id }))
        .unwrap()
        .with_correlation_id(format!("corr-{id}"));
    broker.enqueue(QUEUE, message).await;
}

#[tokio::test]
async fn test_success_completes_message() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::Succeed);
    enqueue_job(&broker, "p-1").await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| broker.messages(QUEUE, SubQueue::Active).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(broker.messages(QUEUE, SubQueue::DeadLetter).is_empty());
}

#[tokio::test]
async fn test_transient_failure_dead_letters_at_third_delivery() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::FailTransient);
    enqueue_job(&broker, "p-1").await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| !broker.messages(QUEUE, SubQueue::DeadLetter).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let dead = broker.messages(QUEUE, SubQueue::DeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_count, 3);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(REASON_MAX_DELIVERIES));
    assert!(dead[0]
        .dead_letter_error_description
        .as_deref()
        .is_some_and(|d| d.contains("HTTP 503")));
    assert!(broker.messages(QUEUE, SubQueue::Active).is_empty());
}

#[tokio::test]
async fn test_redelivered_message_completes_on_recovery() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::SucceedOnDelivery(2));
    enqueue_job(&broker, "p-1").await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| broker.messages(QUEUE, SubQueue::Active).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert!(broker.messages(QUEUE, SubQueue::DeadLetter).is_empty());
}

#[tokio::test]
async fn test_invalid_payload_dead_letters_without_handler() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::Succeed);
    let message = OutgoingMessage::json(&json!({ "unexpected": true })).unwrap();
    broker.enqueue(QUEUE, message).await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| !broker.messages(QUEUE, SubQueue::DeadLetter).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    let dead = broker.messages(QUEUE, SubQueue::DeadLetter);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(REASON_INVALID_FORMAT));
    assert_eq!(dead[0].delivery_count, 1);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_on_first_delivery() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::FailPermanent);
    enqueue_job(&broker, "p-1").await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| !broker.messages(QUEUE, SubQueue::DeadLetter).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    let dead = broker.messages(QUEUE, SubQueue::DeadLetter);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(REASON_PERMANENT_FAILURE));
    assert_eq!(dead[0].correlation_id.as_deref(), Some("corr-p-1"));
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let broker = InMemoryBroker::default();
    let handler = TestHandler::new(Behavior::Sleep(Duration::from_millis(100)));
    for n in 0..6 {
        enqueue_job(&broker, &format!("p-{n}")).await;
    }

    let (tx, handle) = start(&broker, handler.clone(), config().with_max_concurrent_calls(2));
    wait_until(|| broker.messages(QUEUE, SubQueue::Active).is_empty()).await;
    stop(tx, handle).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
    assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_shutdown_leaves_in_flight_message_unsettled() {
    let broker = InMemoryBroker::new(Duration::from_millis(200));
    let handler = TestHandler::new(Behavior::Sleep(Duration::from_secs(60)));
    enqueue_job(&broker, "p-1").await;

    let (tx, handle) = start(&broker, handler.clone(), config());
    wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;
    stop(tx, handle).await;

    // Still on the queue; once the lease lapses another consumer can take it
    assert_eq!(broker.messages(QUEUE, SubQueue::Active).len(), 1);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let redelivered = broker
        .receive(QUEUE, SubQueue::Active, 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].delivery_count(), 2);
}
