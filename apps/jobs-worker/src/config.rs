//! Configuration for the job worker service

use jobs::Pipeline;
use nats_jobs::{ConfigError, NatsConfig};
use std::env;
use std::str::FromStr;

/// Application environment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Global broker section (`NATS_URL`)
    pub nats: NatsConfig,

    /// Pipeline served by this process
    pub pipeline: Pipeline,

    /// Number of concurrent workers draining the dispatch queue
    pub worker_count: usize,

    /// Port for /health, /ready, /state and /metrics
    pub health_port: u16,

    pub environment: Environment,
}

/// Pipeline options and the variables they are read from. Options whose
/// variable is unset are left out so the pipeline defaults apply.
const PIPELINE_VARS: &[(&str, &str, OptionKind)] = &[
    ("NATS_SUBJECT", "subject", OptionKind::Text),
    ("NATS_STREAM", "stream", OptionKind::Text),
    ("NATS_PREFETCH", "prefetch", OptionKind::Int),
    ("NATS_RATE_LIMIT", "rate_limit", OptionKind::Int),
    ("NATS_DELIVER_NEW", "deliver_new", OptionKind::Bool),
    ("NATS_DELETE_AFTER_ACK", "delete_after_ack", OptionKind::Bool),
    ("NATS_DELETE_STREAM_ON_STOP", "delete_stream_on_stop", OptionKind::Bool),
];

#[derive(Debug, Clone, Copy)]
enum OptionKind {
    Text,
    Int,
    Bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let nats = NatsConfig::from_env()?;

        let mut pipeline = Pipeline::new(
            env_or_default("PIPELINE_NAME", "default"),
            env_or_default("PIPELINE_DRIVER", nats_jobs::DRIVER),
        );

        for (key, option, kind) in PIPELINE_VARS {
            let Ok(raw) = env::var(key) else {
                continue;
            };
            pipeline = match kind {
                OptionKind::Text => pipeline.with(*option, raw),
                OptionKind::Int => pipeline.with(*option, parse::<i64>(key, &raw)?),
                OptionKind::Bool => pipeline.with(*option, parse::<bool>(key, &raw)?),
            };
        }

        Ok(Self {
            nats,
            pipeline,
            worker_count: env_parse("WORKER_COUNT", 4)?,
            health_port: env_parse("HEALTH_PORT", 8081)?,
            environment: Environment::from_env(),
        })
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
        key: key.to_string(),
        details: e.to_string(),
    })
}
