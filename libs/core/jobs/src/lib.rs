//! Backend-agnostic abstractions for durable job pipelines.
//!
//! A pipeline connects a broker stream to a local [`DispatchQueue`] that a
//! worker pool drains. This crate holds the pieces every broker binding
//! shares:
//!
//! - [`Job`]: the wire representation producers publish
//! - [`Item`]: a decoded job plus the [`DeliveryHandle`] of its broker message
//! - [`Pipeline`] / [`PipelineState`]: descriptor and status snapshot
//! - [`DispatchQueue`] / [`PriorityQueue`]: the hand-off to workers
//! - [`JobSource`]: the lifecycle capability drivers implement
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐  subscribe  ┌───────────┐  insert  ┌───────────────┐ extract ┌─────────┐
//! │ Broker  │────────────▶│ JobSource │─────────▶│ DispatchQueue │────────▶│ Workers │
//! └─────────┘             └───────────┘          └───────────────┘         └─────────┘
//!      ▲                                                                        │
//!      └──────────────────── ack / nak / requeue (DeliveryHandle) ──────────────┘
//! ```

mod error;
mod job;
mod pipeline;
mod queue;
mod source;

pub use error::{ErrorCategory, JobsError};
pub use job::{DeliveryHandle, Headers, Item, Job, JobOptions};
pub use pipeline::{Pipeline, PipelineState};
pub use queue::{DispatchQueue, PriorityQueue};
pub use source::JobSource;
