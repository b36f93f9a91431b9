//! Shared test utilities for job pipeline testing
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup
//! - `TestNames`: deterministic pipeline, stream and subject names so tests
//!   sharing one server do not collide
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::{TestNames, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires a container runtime"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestNames::from_test_name("my_nats_test");
//!
//!     let stream = names.stream();
//!     let subject = names.subject();
//! }
//! ```

mod nats;

pub use nats::TestNats;

/// Deterministic names derived from a test name.
pub struct TestNames {
    seed: u64,
}

impl TestNames {
    /// Create with a fixed seed
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Pipeline name, e.g. `test-pipeline-12345`
    pub fn pipeline(&self) -> String {
        format!("test-pipeline-{}", self.seed)
    }

    /// Stream name, e.g. `TEST_12345`
    pub fn stream(&self) -> String {
        format!("TEST_{}", self.seed)
    }

    /// Subject, e.g. `test.12345.jobs`
    pub fn subject(&self) -> String {
        format!("test.{}.jobs", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_deterministic() {
        let a = TestNames::from_test_name("my_test");
        let b = TestNames::from_test_name("my_test");

        assert_eq!(a.pipeline(), b.pipeline());
        assert_eq!(a.stream(), b.stream());
        assert_eq!(a.subject(), b.subject());
    }

    #[test]
    fn test_names_differ_per_test() {
        let a = TestNames::from_test_name("test1");
        let b = TestNames::from_test_name("test2");

        assert_ne!(a.stream(), b.stream());
        assert_ne!(a.subject(), b.subject());
    }

    #[test]
    fn test_stream_name_is_valid() {
        let names = TestNames::new(42);
        assert_eq!(names.stream(), "TEST_42");
        assert!(!names.stream().contains('.'));
    }
}
