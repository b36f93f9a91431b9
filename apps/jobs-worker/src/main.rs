//! Job Worker Service - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_worker::run().await
}
