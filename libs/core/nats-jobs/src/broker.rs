//! Broker capability the consumer talks through.
//!
//! [`NatsBroker`](crate::NatsBroker) implements it over a JetStream
//! connection, [`MemoryBroker`](crate::MemoryBroker) in process for tests.

use async_trait::async_trait;
use bytes::Bytes;
use jobs::JobsError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subscription parameters derived from the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subject filter
    pub subject: String,
    /// Stream holding the subject
    pub stream: String,
    /// Durable consumer name, keeps acknowledgement state across resubscribes
    pub durable: String,
    /// Start from new messages instead of replaying the stream
    pub deliver_new: bool,
    /// Push rate limit in bits per second (0 = unlimited)
    pub rate_limit: u64,
    /// Maximum unacknowledged messages in flight
    pub prefetch: usize,
}

/// Counters reported by the broker for an active subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Delivered but not yet acknowledged
    pub ack_pending: u64,
    /// Waiting for delivery
    pub waiting: u64,
}

/// Broker-attached delivery metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Sequence of the message in its stream
    pub stream_sequence: u64,
    /// Delivery attempt, starting at 1
    pub delivered: i64,
}

/// Settles one delivered message.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), JobsError>;
    async fn nak(&self) -> Result<(), JobsError>;
}

/// A raw message pushed by the broker into the local buffer.
pub struct Delivery {
    /// Subject the message was published to
    pub subject: String,
    /// Message body
    pub payload: Bytes,
    metadata: Result<DeliveryMetadata, String>,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    /// A message delivered through a stream consumer.
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        metadata: DeliveryMetadata,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            metadata: Ok(metadata),
            acker,
        }
    }

    /// A message whose delivery metadata could not be read.
    pub fn without_metadata(
        subject: impl Into<String>,
        payload: Bytes,
        reason: impl Into<String>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            metadata: Err(reason.into()),
            acker,
        }
    }

    pub fn metadata(&self) -> Result<DeliveryMetadata, JobsError> {
        self.metadata.clone().map_err(JobsError::Metadata)
    }

    pub fn acker(&self) -> Arc<dyn Acker> {
        self.acker.clone()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Handle to an open push subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop pushing new messages. Messages already in the local buffer stay
    /// there and broker-side acknowledgement state is kept.
    async fn drain(&self) -> Result<(), JobsError>;

    async fn info(&self) -> Result<SubscriptionInfo, JobsError>;
}

/// Operations the consumer needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create `stream` bound to `subjects` unless it already exists.
    async fn ensure_stream(&self, stream: &str, subjects: &[String]) -> Result<(), JobsError>;

    /// Open a push subscription that forwards every message into `sink`.
    async fn subscribe(
        &self,
        options: &SubscribeOptions,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<Box<dyn Subscription>, JobsError>;

    /// Persist `payload` on `subject`, waiting for the stream acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), JobsError>;

    /// Fire-and-forget publish outside of any stream.
    async fn respond(&self, subject: &str, payload: Bytes) -> Result<(), JobsError>;

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), JobsError>;

    async fn delete_stream(&self, stream: &str) -> Result<(), JobsError>;

    /// Flush pending outbound traffic.
    async fn drain(&self) -> Result<(), JobsError>;

    /// Release the connection. Later calls fail.
    async fn close(&self) -> Result<(), JobsError>;
}
