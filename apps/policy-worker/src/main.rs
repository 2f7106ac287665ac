//! Policy Worker Service - Entry Point
//!
//! Background worker that books policies from the policy processing queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    policy_worker::run().await
}
