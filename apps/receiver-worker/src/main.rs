//! Receiver Worker Service - Entry Point
//!
//! Background worker that pulls messages from a queue and processes them
//! transactionally.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    receiver_worker::run().await
}
