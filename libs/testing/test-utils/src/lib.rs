//! Shared test utilities for the messaging crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `QueueNames`: deterministic, per-test queue names (always available)
//!
//! # Features
//!
//! - `nats` (default): Enables the NATS test infrastructure
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{QueueNames, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let queue = QueueNames::from_test_name("my_nats_test").queue("events");
//!     // connect to nats.connection_string() and use `queue`
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Queue names derived from the test name.
///
/// JetStream stream names are global to a server, so tests sharing a
/// container must not reuse them. The same test always gets the same names.
pub struct QueueNames {
    seed: u64,
}

impl QueueNames {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// A queue name made only of characters valid in stream and subject names.
    ///
    /// ```
    /// use test_utils::QueueNames;
    ///
    /// let names = QueueNames::new(7);
    /// assert_eq!(names.queue("events"), "test_events_7");
    /// ```
    pub fn queue(&self, prefix: &str) -> String {
        format!("test_{}_{}", prefix, self.seed)
    }
}
