//! Delivery handle bound to one stream message.

use crate::broker::{Acker, Broker};
use crate::metrics::JobsMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use jobs::{DeliveryHandle, Job, JobsError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a pipeline's messages live, shared by every handle it creates.
pub(crate) struct Route {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) subject: String,
    pub(crate) stream: String,
    pub(crate) delete_after_ack: bool,
    pub(crate) metrics: JobsMetrics,
}

impl Route {
    /// Serialize and publish a job to the pipeline subject.
    ///
    /// Delayed jobs are rejected before anything is published.
    pub(crate) async fn publish(&self, job: &Job) -> Result<(), JobsError> {
        if job.is_delayed() {
            return Err(JobsError::unsupported(
                "nats does not support delayed messages",
            ));
        }

        let data = serde_json::to_vec(job)?;
        self.broker.publish(&self.subject, Bytes::from(data)).await
    }
}

pub(crate) struct NatsDelivery {
    route: Arc<Route>,
    acker: Arc<dyn Acker>,
    sequence: u64,
}

impl NatsDelivery {
    pub(crate) fn new(route: Arc<Route>, acker: Arc<dyn Acker>, sequence: u64) -> Self {
        Self {
            route,
            acker,
            sequence,
        }
    }
}

#[async_trait]
impl DeliveryHandle for NatsDelivery {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    async fn ack(&self) -> Result<(), JobsError> {
        self.acker.ack().await?;

        if self.route.delete_after_ack {
            if let Err(e) = self
                .route
                .broker
                .delete_message(&self.route.stream, self.sequence)
                .await
            {
                self.route.metrics.delete_failed("ack");
                return Err(e);
            }
        }

        Ok(())
    }

    async fn nak(&self) -> Result<(), JobsError> {
        self.acker.nak().await
    }

    async fn requeue(&self, job: &Job) -> Result<(), JobsError> {
        self.route.publish(job).await?;
        self.route.metrics.requeued();

        // Duplicates are acceptable, a failed delete only gets counted.
        match self
            .route
            .broker
            .delete_message(&self.route.stream, self.sequence)
            .await
        {
            Ok(()) => debug!(
                stream = %self.route.stream,
                sequence = self.sequence,
                "Requeued message deleted"
            ),
            Err(e) => {
                warn!(
                    stream = %self.route.stream,
                    sequence = self.sequence,
                    error = %e,
                    "Failed to delete requeued message"
                );
                self.route.metrics.delete_failed("requeue");
            }
        }

        Ok(())
    }

    async fn respond(&self, data: &[u8], subject: &str) -> Result<(), JobsError> {
        self.route
            .broker
            .respond(subject, Bytes::copy_from_slice(data))
            .await
    }
}
