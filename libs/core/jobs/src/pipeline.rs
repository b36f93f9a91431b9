//! Pipeline descriptors and state snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named route between a broker stream and the local dispatch queue.
///
/// The descriptor only carries driver-agnostic data: a name, the driver that
/// serves it and a bag of driver options. Each driver reads the options it
/// understands through the typed accessors, supplying its own defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    driver: String,
    #[serde(default, flatten)]
    options: Map<String, Value>,
}

impl Pipeline {
    /// Create a pipeline with no options.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            options: Map::new(),
        }
    }

    /// Set a driver option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Whether an option is present.
    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// String option, or `default` when absent or not a string.
    pub fn string(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Integer option, or `default` when absent.
    ///
    /// Numeric strings are accepted since env-driven configs carry everything
    /// as text.
    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.options.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Boolean option, or `default` when absent.
    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.options.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }
}

/// Point-in-time view of a pipeline, as reported by its job source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Pipeline name
    pub pipeline: String,
    /// Driver serving the pipeline
    pub driver: String,
    /// Broker routing key the pipeline consumes
    pub queue: String,
    /// Messages delivered but not yet acknowledged
    pub active: i64,
    /// Delayed messages (always 0 for drivers without delayed delivery)
    pub delayed: i64,
    /// Messages reserved by the broker for this consumer
    pub reserved: i64,
    /// Whether a listener is currently delivering messages
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_accessors_with_defaults() {
        let pipeline = Pipeline::new("p1", "nats")
            .with("subject", "jobs.p1")
            .with("prefetch", 10)
            .with("deliver_new", true);

        assert_eq!(pipeline.name(), "p1");
        assert_eq!(pipeline.driver(), "nats");
        assert_eq!(pipeline.string("subject", "default"), "jobs.p1");
        assert_eq!(pipeline.string("stream", "default-stream"), "default-stream");
        assert_eq!(pipeline.int("prefetch", 100), 10);
        assert_eq!(pipeline.int("rate_limit", 1000), 1000);
        assert!(pipeline.bool("deliver_new", false));
        assert!(!pipeline.bool("delete_after_ack", false));
    }

    #[test]
    fn test_string_values_are_parsed() {
        let pipeline = Pipeline::new("p1", "nats")
            .with("prefetch", "25")
            .with("deliver_new", "true")
            .with("rate_limit", "not-a-number");

        assert_eq!(pipeline.int("prefetch", 100), 25);
        assert!(pipeline.bool("deliver_new", false));
        assert_eq!(pipeline.int("rate_limit", 1000), 1000);
    }

    #[test]
    fn test_deserialize_flattened_options() {
        let pipeline: Pipeline = serde_json::from_value(json!({
            "name": "p1",
            "driver": "nats",
            "subject": "jobs.p1",
            "prefetch": 10
        }))
        .unwrap();

        assert!(pipeline.has("subject"));
        assert_eq!(pipeline.int("prefetch", 100), 10);
    }
}
