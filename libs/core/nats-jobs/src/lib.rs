//! NATS JetStream job source.
//!
//! [`NatsConsumer`] attaches a pipeline to a JetStream stream through a
//! durable push consumer, buffers up to `prefetch` messages locally and feeds
//! decoded jobs into a [`jobs::DispatchQueue`]. Workers settle each job
//! through the delivery handle carried by its [`jobs::Item`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ push  ┌──────────────┐ recv  ┌──────────┐ insert ┌───────────────┐
//! │  JetStream   │──────▶│ local buffer │──────▶│ listener │───────▶│ DispatchQueue │
//! │ (durable     │       │ (prefetch)   │       │  task    │        └───────────────┘
//! │  consumer)   │◀──────────────────────────────────────────── ack / nak / requeue
//! └──────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Pause/Resume**: the durable consumer keeps acknowledgement state
//! - **Explicit acks**: ack, nak, requeue and respond per message
//! - **Delete after ack**: optional removal of acknowledged messages
//! - **Failure isolation**: undecodable messages are dropped and counted
//!
//! Delayed delivery is not supported; pushing or requeueing a job with a
//! delay fails with [`jobs::JobsError::UnsupportedFeature`].
//!
//! The broker is reached through the [`Broker`] trait: [`NatsBroker`] talks
//! to a real server, [`MemoryBroker`] runs in process.

mod broker;
mod client;
mod config;
mod consumer;
mod delivery;
mod listener;
mod memory;
pub mod metrics;

pub use broker::{
    Acker, Broker, Delivery, DeliveryMetadata, SubscribeOptions, Subscription, SubscriptionInfo,
};
pub use client::NatsBroker;
pub use config::{
    durable_name, resolve_config, resolve_pipeline, ConfigError, ConsumerConfig, NatsConfig,
    PipelineConfig, DEFAULT_ADDR, DEFAULT_PREFETCH, DEFAULT_RATE_LIMIT, DEFAULT_STREAM,
    DEFAULT_SUBJECT, MAX_PREFETCH,
};
pub use consumer::{ConsumerState, NatsConsumer};
pub use memory::{MemoryBroker, Published};
pub use crate::metrics::{init_metrics, render_metrics, JobsMetrics};

/// Driver name this crate registers pipelines under.
pub const DRIVER: &str = "nats";
