//! NATS test infrastructure

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// NATS server with JetStream, running in a container.
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
/// let url = nats.url();
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    // Held for its Drop.
    _container: ContainerAsync<Nats>,
    client: Client,
    url: String,
}

impl TestNats {
    /// Start a NATS container with JetStream (`-js`) and connect to it.
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

        let url = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&url)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            _container: container,
            client,
            url,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Server URL, for code under test that connects on its own.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delete a stream if it exists. Useful between tests sharing a server.
    pub async fn delete_stream(&self, name: &str) {
        if let Err(e) = self.jetstream().delete_stream(name).await {
            tracing::debug!(stream = %name, error = %e, "Stream not deleted");
        }
    }
}
