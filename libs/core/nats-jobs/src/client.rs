//! JetStream-backed broker.

use crate::broker::{
    Acker, Broker, Delivery, DeliveryMetadata, SubscribeOptions, Subscription, SubscriptionInfo,
};
use async_nats::jetstream::consumer::{push, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use jobs::JobsError;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Connection {
    client: Client,
    jetstream: Context,
}

/// Broker over a NATS connection with JetStream enabled.
pub struct NatsBroker {
    connection: RwLock<Option<Connection>>,
}

impl NatsBroker {
    /// Connect to `addr`.
    ///
    /// Reconnects are handled by the client without limit; connection events
    /// are logged.
    pub async fn connect(addr: &str) -> Result<Self, JobsError> {
        let client = ConnectOptions::new()
            .no_echo()
            .connection_timeout(CONNECT_TIMEOUT)
            .ping_interval(PING_INTERVAL)
            .max_reconnects(None::<usize>)
            .event_callback(|event| async move { log_event(event) })
            .connect(addr)
            .await
            .map_err(|e| JobsError::Connect(e.to_string()))?;

        info!(addr = %addr, "Connected to NATS");

        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            connection: RwLock::new(Some(Connection { client, jetstream })),
        }
    }

    fn connection(&self) -> Result<Connection, JobsError> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| JobsError::Broker("connection closed".to_string()))
    }
}

fn log_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected, reconnecting"),
        Event::LameDuckMode => warn!("NATS server entered lame duck mode"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer"),
        Event::ServerError(e) => error!(error = %e, "NATS server error"),
        Event::ClientError(e) => error!(error = %e, "NATS client error"),
        other => debug!(event = %other, "NATS event"),
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn ensure_stream(&self, stream: &str, subjects: &[String]) -> Result<(), JobsError> {
        let conn = self.connection()?;

        match conn.jetstream.get_stream(stream).await {
            Ok(_) => {
                debug!(stream = %stream, "Stream already exists");
                Ok(())
            }
            Err(_) => {
                info!(stream = %stream, subjects = ?subjects, "Creating stream");

                conn.jetstream
                    .create_stream(StreamConfig {
                        name: stream.to_string(),
                        subjects: subjects.to_vec(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| JobsError::Broker(e.to_string()))?;

                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        options: &SubscribeOptions,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<Box<dyn Subscription>, JobsError> {
        let conn = self.connection()?;

        let stream = conn
            .jetstream
            .get_stream(&options.stream)
            .await
            .map_err(|e| JobsError::Subscribe(e.to_string()))?;

        let deliver_policy = if options.deliver_new {
            DeliverPolicy::New
        } else {
            DeliverPolicy::All
        };

        let consumer = stream
            .get_or_create_consumer(
                &options.durable,
                push::Config {
                    deliver_subject: format!("_deliver.{}", options.durable),
                    durable_name: Some(options.durable.clone()),
                    deliver_policy,
                    ack_policy: AckPolicy::Explicit,
                    rate_limit: options.rate_limit,
                    max_ack_pending: i64::try_from(options.prefetch).unwrap_or(i64::MAX),
                    filter_subject: options.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| JobsError::Subscribe(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| JobsError::Subscribe(e.to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let pump = tokio::spawn(forward(messages, sink, stop_rx));

        debug!(
            stream = %options.stream,
            durable = %options.durable,
            subject = %options.subject,
            "Subscribed"
        );

        Ok(Box::new(NatsSubscription {
            jetstream: conn.jetstream,
            stream: options.stream.clone(),
            durable: options.durable.clone(),
            stop: stop_tx,
            pump: Mutex::new(Some(pump)),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), JobsError> {
        let conn = self.connection()?;

        conn.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| JobsError::Publish(e.to_string()))?
            .await
            .map_err(|e| JobsError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn respond(&self, subject: &str, payload: Bytes) -> Result<(), JobsError> {
        let conn = self.connection()?;

        conn.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| JobsError::Publish(e.to_string()))
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), JobsError> {
        let conn = self.connection()?;

        let stream = conn
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| JobsError::Delete(e.to_string()))?;

        stream
            .delete_message(sequence)
            .await
            .map_err(|e| JobsError::Delete(e.to_string()))?;

        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), JobsError> {
        let conn = self.connection()?;

        conn.jetstream
            .delete_stream(stream)
            .await
            .map_err(|e| JobsError::Delete(e.to_string()))?;

        info!(stream = %stream, "Stream deleted");
        Ok(())
    }

    async fn drain(&self) -> Result<(), JobsError> {
        let conn = self.connection()?;

        // Drains every subscription, flushes, then closes the connection for
        // all clones of the client, including those held by unsettled messages.
        conn.client
            .drain()
            .await
            .map_err(|e| JobsError::Broker(e.to_string()))?;

        info!("NATS connection drained");
        Ok(())
    }

    async fn close(&self) -> Result<(), JobsError> {
        // Dropping the last client handle closes the connection.
        if self.connection.write().take().is_some() {
            info!("NATS connection closed");
        }
        Ok(())
    }
}

/// Forward pushed messages into the local buffer until stopped.
async fn forward(
    mut messages: push::Messages,
    sink: mpsc::Sender<Delivery>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = messages.next() => match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving message");
                    continue;
                }
                None => break,
            },
        };

        let delivery = into_delivery(message);

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            sent = sink.send(delivery) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let subject = message.subject.to_string();
    let payload = message.payload.clone();
    let metadata = message.info().map(|info| DeliveryMetadata {
        stream_sequence: info.stream_sequence,
        delivered: info.delivered,
    });

    match metadata {
        Ok(metadata) => Delivery::new(
            subject,
            payload,
            metadata,
            Arc::new(JetStreamAcker(message)),
        ),
        Err(e) => {
            let reason = e.to_string();
            Delivery::without_metadata(
                subject,
                payload,
                reason,
                Arc::new(JetStreamAcker(message)),
            )
        }
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), JobsError> {
        self.0
            .ack()
            .await
            .map_err(|e| JobsError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<(), JobsError> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| JobsError::Ack(e.to_string()))
    }
}

struct NatsSubscription {
    jetstream: Context,
    stream: String,
    durable: String,
    stop: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn drain(&self) -> Result<(), JobsError> {
        let _ = self.stop.send(true);

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.await
                .map_err(|e| JobsError::Broker(format!("subscription task failed: {e}")))?;
        }

        debug!(durable = %self.durable, "Subscription drained");
        Ok(())
    }

    async fn info(&self) -> Result<SubscriptionInfo, JobsError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream)
            .await
            .map_err(|e| JobsError::Broker(e.to_string()))?;

        let mut consumer = stream
            .get_consumer::<push::Config>(&self.durable)
            .await
            .map_err(|e| JobsError::Broker(e.to_string()))?;

        let info = consumer
            .info()
            .await
            .map_err(|e| JobsError::Broker(e.to_string()))?;

        Ok(SubscriptionInfo {
            ack_pending: info.num_ack_pending as u64,
            waiting: info.num_waiting as u64,
        })
    }
}
