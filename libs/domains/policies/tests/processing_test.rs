//! End-to-end policy processing tests
//!
//! These tests run the real QueueWorker, PolicyProcessor and HTTP booking client
//! against the in-memory broker, the in-memory repository and a stub booking
//! system served by axum on an ephemeral port.

use axum::{http::StatusCode, routing::post, Router};
use domain_policies::*;
use queue_worker::resilience::RetryPolicy;
use queue_worker::{
    InMemoryBroker, OutgoingMessage, QueueDef, QueueWorker, ResilienceConfig, SubQueue,
    WorkerConfig, REASON_MAX_DELIVERIES, REASON_PERMANENT_FAILURE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const QUEUE: &str = PolicyProcessingQueue::QUEUE_NAME;

async fn booking_stub(status: StatusCode, body: &'static str) -> String {
    let app = Router::new().route("/posts", post(move || async move { (status, body) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct Harness {
    broker: InMemoryBroker,
    repository: Arc<InMemoryPolicyRepository>,
    output: tempfile::TempDir,
    shutdown: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(booking_url: &str) -> Self {
        let broker = InMemoryBroker::default();
        let repository = Arc::new(InMemoryPolicyRepository::new());
        let output = tempfile::tempdir().unwrap();

        let resilience = ResilienceConfig::new("booking-system")
            .with_retry(RetryPolicy::new(1).with_base_delay(Duration::from_millis(1)));
        let client = Arc::new(
            HttpBookingSystemClient::with_resilience(BookingClientConfig::new(booking_url), resilience)
                .unwrap(),
        );
        let processor = PolicyProcessor::new(
            repository.clone(),
            client,
            TransferFileWriter::new(output.path()),
        );

        let config = WorkerConfig::from_queue_def::<PolicyProcessingQueue>()
            .with_receive_wait(Duration::from_millis(50));
        let worker = QueueWorker::new(Arc::new(broker.clone()), processor, config);

        let (shutdown, rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            worker.run(rx).await.unwrap();
        });

        Self {
            broker,
            repository,
            output,
            shutdown,
            worker,
        }
    }

    async fn publish(&self, policy_id: Uuid, correlation_id: &str) {
        let command = ProcessPolicyCommand {
            policy_id,
            policy_number: "POL-2024-0001".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@example.com".into(),
            customer_age: 42,
            policy_type: "Health".into(),
            premium: 1250.5,
            correlation_id: correlation_id.into(),
            retry_count: 0,
        };
        let message = OutgoingMessage::json(&command)
            .unwrap()
            .with_correlation_id(correlation_id)
            .with_subject("ProcessPolicy");
        self.broker.enqueue(QUEUE, message).await;
    }

    async fn wait_until(&self, condition: impl Fn(&InMemoryBroker) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition(&self.broker) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.worker.await.unwrap();
    }
}

async fn seed_policy(repository: &InMemoryPolicyRepository) -> Uuid {
    let policy = Policy::pending(Uuid::now_v7(), "POL-2024-0001", "Jane Doe", "jane@example.com");
    let id = policy.id;
    repository.insert(policy).await;
    id
}

#[tokio::test]
async fn test_booked_policy_is_approved_and_message_completed() {
    let url = booking_stub(
        StatusCode::OK,
        r#"{"success":true,"status":"Booked","externalPolicyId":"EXT-42"}"#,
    )
    .await;
    let harness = Harness::start(&url).await;
    let id = seed_policy(&harness.repository).await;

    harness.publish(id, "corr-approved").await;
    harness
        .wait_until(|b| b.messages(QUEUE, SubQueue::Active).is_empty())
        .await;

    let policy = harness.repository.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(policy.status, PolicyStatus::Approved);
    assert_eq!(policy.external_reference_id.as_deref(), Some("EXT-42"));
    assert!(harness.output.path().join("POLICY_corr-approved.txt").exists());
    assert!(harness.broker.messages(QUEUE, SubQueue::DeadLetter).is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn test_declined_booking_rejects_policy() {
    let url = booking_stub(
        StatusCode::OK,
        r#"{"success":false,"status":"Declined","rejectionReason":"age limit"}"#,
    )
    .await;
    let harness = Harness::start(&url).await;
    let id = seed_policy(&harness.repository).await;

    harness.publish(id, "corr-declined").await;
    harness
        .wait_until(|b| b.messages(QUEUE, SubQueue::Active).is_empty())
        .await;

    let policy = harness.repository.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(policy.status, PolicyStatus::Rejected);
    assert_eq!(policy.rejection_reason.as_deref(), Some("age limit"));
    harness.stop().await;
}

#[tokio::test]
async fn test_unavailable_booking_system_dead_letters_after_three_deliveries() {
    let url = booking_stub(StatusCode::SERVICE_UNAVAILABLE, "").await;
    let harness = Harness::start(&url).await;
    let id = seed_policy(&harness.repository).await;

    harness.publish(id, "corr-down").await;
    harness
        .wait_until(|b| !b.messages(QUEUE, SubQueue::DeadLetter).is_empty())
        .await;

    let dead = harness.broker.messages(QUEUE, SubQueue::DeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_count, 3);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(REASON_MAX_DELIVERIES));
    assert_eq!(dead[0].correlation_id.as_deref(), Some("corr-down"));

    let policy = harness.repository.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(policy.status, PolicyStatus::Pending);
    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_policy_dead_letters_immediately() {
    let url = booking_stub(StatusCode::OK, r#"{"success":true}"#).await;
    let harness = Harness::start(&url).await;

    harness.publish(Uuid::now_v7(), "corr-missing").await;
    harness
        .wait_until(|b| !b.messages(QUEUE, SubQueue::DeadLetter).is_empty())
        .await;

    let dead = harness.broker.messages(QUEUE, SubQueue::DeadLetter);
    assert_eq!(dead[0].delivery_count, 1);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(REASON_PERMANENT_FAILURE));
    harness.stop().await;
}
