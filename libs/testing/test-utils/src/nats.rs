//! NATS test infrastructure
//!
//! `TestNats` runs a NATS server with JetStream in a container.

use async_nats::Client;
use async_nats::jetstream::{self, Context};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Address for a job source under test
/// let addr = nats.addr();
///
/// // Inspect streams directly
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    addr: String,
}

impl TestNats {
    /// Start a NATS server with JetStream enabled (`-js`)
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag("latest")
            .with_cmd(["-js"])
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let addr = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&addr)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            addr,
        }
    }

    /// Server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// A client independent of the code under test
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// JetStream context on the test client
    pub fn jetstream(&self) -> Context {
        jetstream::new(self.client.clone())
    }

    /// Number of messages currently stored in `stream`, `None` if it does not exist
    pub async fn stream_messages(&self, stream: &str) -> Option<u64> {
        let mut stream = self.jetstream().get_stream(stream).await.ok()?;
        let info = stream.info().await.ok()?;
        Some(info.state.messages)
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}
