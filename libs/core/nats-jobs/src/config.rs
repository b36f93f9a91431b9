//! Broker and pipeline configuration.
//!
//! Defaults are decided here and nowhere else. A pipeline declared at runtime
//! goes through [`resolve_pipeline`], one declared in a configuration tree
//! through [`resolve_config`].

use jobs::{JobsError, Pipeline};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use thiserror::Error;

/// Key of the global broker section in a configuration tree.
pub const GLOBAL_KEY: &str = "nats";

pub const DEFAULT_ADDR: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_SUBJECT: &str = "default";
pub const DEFAULT_STREAM: &str = "default-stream";
pub const DEFAULT_PREFETCH: usize = 100;
/// Upper bound for `prefetch`; it sizes both the local buffer and the
/// broker's `max_ack_pending`.
pub const MAX_PREFETCH: usize = 1_000_000;
pub const DEFAULT_RATE_LIMIT: u64 = 1000;

// Pipeline option keys
const OPT_SUBJECT: &str = "subject";
const OPT_STREAM: &str = "stream";
const OPT_PREFETCH: &str = "prefetch";
const OPT_RATE_LIMIT: &str = "rate_limit";
const OPT_DELIVER_NEW: &str = "deliver_new";
const OPT_DELETE_AFTER_ACK: &str = "delete_after_ack";
const OPT_DELETE_STREAM_ON_STOP: &str = "delete_stream_on_stop";
const OPT_DURABLE: &str = "durable";

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("no global nats configuration, global configuration should contain NATS URL")]
    MissingGlobal,

    #[error("configuration section '{0}' not found")]
    MissingSection(String),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for JobsError {
    fn from(err: ConfigError) -> Self {
        JobsError::Configuration(err.to_string())
    }
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

fn default_prefetch() -> usize {
    DEFAULT_PREFETCH
}

fn default_rate_limit() -> u64 {
    DEFAULT_RATE_LIMIT
}

/// Global broker section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server address
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl NatsConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Load from `NATS_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let addr =
            env::var("NATS_URL").map_err(|_| ConfigError::MissingEnvVar("NATS_URL".to_string()))?;
        Ok(Self { addr })
    }

    /// Read the global section of a configuration tree.
    pub fn from_source(source: &Value) -> Result<Self, ConfigError> {
        let section = source.get(GLOBAL_KEY).ok_or(ConfigError::MissingGlobal)?;
        serde_json::from_value(section.clone()).map_err(|e| ConfigError::ParseError {
            key: GLOBAL_KEY.to_string(),
            details: e.to_string(),
        })
    }
}

/// Per-pipeline routing and delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Subject jobs are published to and consumed from
    #[serde(default = "default_subject")]
    pub subject: String,

    /// Stream storing the subject
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Local buffer size and broker max-ack-pending
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Push rate limit in bits per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,

    /// Deliver only messages published after the subscription starts
    #[serde(default)]
    pub deliver_new: bool,

    /// Remove a message from the stream once acknowledged
    #[serde(default)]
    pub delete_after_ack: bool,

    /// Remove the whole stream when the consumer stops
    #[serde(default)]
    pub delete_stream_on_stop: bool,

    /// Durable consumer name (derived from the pipeline name when empty)
    #[serde(default)]
    pub durable: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            stream: default_stream(),
            prefetch: DEFAULT_PREFETCH,
            rate_limit: DEFAULT_RATE_LIMIT,
            deliver_new: false,
            delete_after_ack: false,
            delete_stream_on_stop: false,
            durable: String::new(),
        }
    }
}

impl PipelineConfig {
    /// Read the options of a pipeline descriptor, applying defaults.
    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self, ConfigError> {
        let prefetch = pipeline.int(OPT_PREFETCH, DEFAULT_PREFETCH as i64);
        let prefetch = usize::try_from(prefetch)
            .map_err(|_| ConfigError::invalid(OPT_PREFETCH, format!("{prefetch} is negative")))?;

        let rate_limit = pipeline.int(OPT_RATE_LIMIT, DEFAULT_RATE_LIMIT as i64);
        let rate_limit = u64::try_from(rate_limit).map_err(|_| {
            ConfigError::invalid(OPT_RATE_LIMIT, format!("{rate_limit} is negative"))
        })?;

        let config = Self {
            subject: pipeline.string(OPT_SUBJECT, DEFAULT_SUBJECT),
            stream: pipeline.string(OPT_STREAM, DEFAULT_STREAM),
            prefetch,
            rate_limit,
            deliver_new: pipeline.bool(OPT_DELIVER_NEW, false),
            delete_after_ack: pipeline.bool(OPT_DELETE_AFTER_ACK, false),
            delete_stream_on_stop: pipeline.bool(OPT_DELETE_STREAM_ON_STOP, false),
            durable: pipeline.string(OPT_DURABLE, ""),
        };

        config.finish(pipeline.name())
    }

    fn finish(mut self, name: &str) -> Result<Self, ConfigError> {
        if self.durable.is_empty() {
            self.durable = durable_name(name);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::invalid(OPT_PREFETCH, "must be greater than 0"));
        }
        if self.prefetch > MAX_PREFETCH {
            return Err(ConfigError::invalid(
                OPT_PREFETCH,
                format!("must not exceed {MAX_PREFETCH}"),
            ));
        }
        if self.subject.trim().is_empty() {
            return Err(ConfigError::invalid(OPT_SUBJECT, "must not be empty"));
        }
        if self.stream.trim().is_empty() {
            return Err(ConfigError::invalid(OPT_STREAM, "must not be empty"));
        }
        if self.durable.is_empty() {
            return Err(ConfigError::invalid(OPT_DURABLE, "must not be empty"));
        }
        Ok(())
    }
}

/// Durable consumer name for a pipeline: anything outside `[A-Za-z0-9_-]`
/// becomes `_`.
pub fn durable_name(pipeline: &str) -> String {
    pipeline
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Fully resolved consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Broker address
    pub addr: String,
    /// Pipeline name, used as the metrics label
    pub name: String,
    pub pipeline: PipelineConfig,
}

/// Resolve a pipeline declared at runtime against the global broker section.
pub fn resolve_pipeline(
    global: Option<&NatsConfig>,
    pipeline: &Pipeline,
) -> Result<ConsumerConfig, ConfigError> {
    let global = global.ok_or(ConfigError::MissingGlobal)?;

    Ok(ConsumerConfig {
        addr: global.addr.clone(),
        name: pipeline.name().to_string(),
        pipeline: PipelineConfig::from_pipeline(pipeline)?,
    })
}

/// Resolve a pipeline declared under `key` (dot separated) in `source`.
///
/// The global `nats` section of the same tree provides the address.
pub fn resolve_config(key: &str, source: &Value) -> Result<ConsumerConfig, ConfigError> {
    let pointer = format!("/{}", key.replace('.', "/"));
    let section = source
        .pointer(&pointer)
        .ok_or_else(|| ConfigError::MissingSection(key.to_string()))?;

    let global = NatsConfig::from_source(source)?;

    let pipeline: PipelineConfig =
        serde_json::from_value(section.clone()).map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        })?;

    let name = key.rsplit('.').next().unwrap_or(key).to_string();
    let pipeline = pipeline.finish(&name)?;

    Ok(ConsumerConfig {
        addr: global.addr,
        name,
        pipeline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_env_requires_nats_url() {
        temp_env::with_var_unset("NATS_URL", || {
            let result = NatsConfig::from_env();
            assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "NATS_URL"));
        });

        temp_env::with_var("NATS_URL", Some("nats://nats:4222"), || {
            let config = NatsConfig::from_env().unwrap();
            assert_eq!(config.addr, "nats://nats:4222");
        });
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::from_pipeline(&Pipeline::new("emails", "nats")).unwrap();

        assert_eq!(config.subject, "default");
        assert_eq!(config.stream, "default-stream");
        assert_eq!(config.prefetch, 100);
        assert_eq!(config.rate_limit, 1000);
        assert!(!config.deliver_new);
        assert!(!config.delete_after_ack);
        assert!(!config.delete_stream_on_stop);
        assert_eq!(config.durable, "emails");
    }

    #[test]
    fn test_pipeline_options() {
        let pipeline = Pipeline::new("p1", "nats")
            .with("subject", "jobs.p1")
            .with("stream", "s1")
            .with("prefetch", 10)
            .with("rate_limit", "500")
            .with("deliver_new", true)
            .with("delete_stream_on_stop", "true");

        let config = PipelineConfig::from_pipeline(&pipeline).unwrap();
        assert_eq!(config.subject, "jobs.p1");
        assert_eq!(config.stream, "s1");
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.rate_limit, 500);
        assert!(config.deliver_new);
        assert!(config.delete_stream_on_stop);
    }

    #[test]
    fn test_pipeline_validation() {
        let zero = Pipeline::new("p1", "nats").with("prefetch", 0);
        assert!(matches!(
            PipelineConfig::from_pipeline(&zero),
            Err(ConfigError::Invalid { ref field, .. }) if field == "prefetch"
        ));

        let negative = Pipeline::new("p1", "nats").with("rate_limit", -5);
        assert!(PipelineConfig::from_pipeline(&negative).is_err());

        let empty_subject = Pipeline::new("p1", "nats").with("subject", "  ");
        assert!(PipelineConfig::from_pipeline(&empty_subject).is_err());

        let huge = Pipeline::new("p1", "nats").with("prefetch", 1i64 << 62);
        assert!(matches!(
            PipelineConfig::from_pipeline(&huge),
            Err(ConfigError::Invalid { ref field, .. }) if field == "prefetch"
        ));
        assert!(resolve_pipeline(Some(&NatsConfig::new(DEFAULT_ADDR)), &huge).is_err());

        let largest = Pipeline::new("p1", "nats").with("prefetch", MAX_PREFETCH as i64);
        assert_eq!(
            PipelineConfig::from_pipeline(&largest).unwrap().prefetch,
            MAX_PREFETCH
        );
    }

    #[test]
    fn test_durable_name_sanitized() {
        assert_eq!(durable_name("emails"), "emails");
        assert_eq!(durable_name("jobs.p1 high"), "jobs_p1_high");
        assert_eq!(durable_name("a-b_c"), "a-b_c");
    }

    #[test]
    fn test_resolve_pipeline_requires_global() {
        let pipeline = Pipeline::new("p1", "nats");

        let err = resolve_pipeline(None, &pipeline).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGlobal));

        let jobs_err: JobsError = err.into();
        assert!(matches!(jobs_err, JobsError::Configuration(_)));

        let global = NatsConfig::new("nats://localhost:4222");
        let resolved = resolve_pipeline(Some(&global), &pipeline).unwrap();
        assert_eq!(resolved.addr, "nats://localhost:4222");
        assert_eq!(resolved.name, "p1");
    }

    #[test]
    fn test_resolve_config() {
        let source = json!({
            "nats": {},
            "jobs": {
                "pipelines": {
                    "emails": {
                        "subject": "jobs.emails",
                        "prefetch": 5
                    }
                }
            }
        });

        let resolved = resolve_config("jobs.pipelines.emails", &source).unwrap();
        assert_eq!(resolved.addr, DEFAULT_ADDR);
        assert_eq!(resolved.name, "emails");
        assert_eq!(resolved.pipeline.subject, "jobs.emails");
        assert_eq!(resolved.pipeline.stream, DEFAULT_STREAM);
        assert_eq!(resolved.pipeline.prefetch, 5);
        assert_eq!(resolved.pipeline.durable, "emails");
    }

    #[test]
    fn test_resolve_config_missing_sections() {
        let no_global = json!({ "emails": { "subject": "jobs.emails" } });
        assert!(matches!(
            resolve_config("emails", &no_global),
            Err(ConfigError::MissingGlobal)
        ));

        let no_pipeline = json!({ "nats": { "addr": "nats://n:4222" } });
        assert!(matches!(
            resolve_config("emails", &no_pipeline),
            Err(ConfigError::MissingSection(_))
        ));
    }
}
