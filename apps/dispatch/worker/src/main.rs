//! Dispatch Worker Service - Entry Point
//!
//! Background worker process that drains the email priority streams.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatch_worker::run().await
}
