//! Dispatch Scheduler Service - Entry Point
//!
//! Single-instance process that promotes scheduled emails and due retries.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatch_scheduler::run().await
}
