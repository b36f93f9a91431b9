//! Listener task: local buffer to dispatch queue.

use crate::broker::Delivery;
use crate::delivery::{NatsDelivery, Route};
use jobs::{DispatchQueue, Item, Job};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace};

pub(crate) struct Listener {
    pub(crate) route: Arc<Route>,
    pub(crate) queue: Arc<dyn DispatchQueue>,
}

impl Listener {
    /// Read the buffer until `stop` fires, then hand the buffer back so the
    /// next run continues with whatever is still queued in it.
    pub(crate) async fn run(
        self,
        mut buffer: mpsc::Receiver<Delivery>,
        mut stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Delivery> {
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = buffer.recv() => match next {
                    Some(delivery) => self.dispatch(delivery),
                    None => break,
                },
            }
        }

        buffer
    }

    fn dispatch(&self, delivery: Delivery) {
        let metrics = &self.route.metrics;
        metrics.message_received();

        let metadata = match delivery.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                info!(subject = %delivery.subject, error = %e, "not a stream message, dropping");
                metrics.message_dropped("metadata");
                return;
            }
        };

        let job: Job = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    subject = %delivery.subject,
                    sequence = metadata.stream_sequence,
                    error = %e,
                    "Failed to decode job, dropping"
                );
                metrics.message_dropped("decode");
                return;
            }
        };

        trace!(
            job_id = %job.id,
            sequence = metadata.stream_sequence,
            delivered = metadata.delivered,
            "Dispatching job"
        );

        let handle = NatsDelivery::new(
            self.route.clone(),
            delivery.acker(),
            metadata.stream_sequence,
        );
        self.queue.insert(Item::new(job, Arc::new(handle)));
    }
}
