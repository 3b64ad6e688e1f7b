//! Shared test utilities for the messaging crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: deterministic stream names and subjects (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_jetstream_test() {
//!     let nats = TestNats::new().await;
//!     let data = TestDataBuilder::from_test_name("my_jetstream_test");
//!
//!     let stream = data.stream_name("orders");
//!     let subject = data.subject("orders", "created");
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test data with deterministic randomization
///
/// Streams and durable consumers outlive a single test on a shared server, so
/// names derived from the test name keep concurrent tests apart.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_publish_retries");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name unique to this builder.
    ///
    /// JetStream stream names may not contain `.`, `*`, `>` or whitespace.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.stream_name("orders"), "TEST_ORDERS_7");
    /// ```
    pub fn stream_name(&self, prefix: &str) -> String {
        format!("TEST_{}_{}", prefix.to_uppercase(), self.seed)
    }

    /// Subject under a prefix unique to this builder.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.subject("orders", "created"), "test7.orders.created");
    /// ```
    pub fn subject(&self, domain: &str, event: &str) -> String {
        format!("test{}.{}.{}", self.seed, domain, event)
    }

    /// Wildcard covering every subject from [`Self::subject`].
    pub fn subject_wildcard(&self) -> String {
        format!("test{}.>", self.seed)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Await `future`, panicking with `context` if it takes longer than `limit`
    pub async fn within<F: Future>(limit: Duration, context: &str, future: F) -> F::Output {
        tokio::time::timeout(limit, future)
            .await
            .unwrap_or_else(|_| panic!("{}: timed out after {:?}", context, limit))
    }
}
