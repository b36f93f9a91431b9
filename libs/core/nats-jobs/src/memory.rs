//! In-process broker with JetStream-like semantics.
//!
//! Streams keep every published message under a sequence number; durable
//! consumers remember their cursor across subscriptions, so a drained and
//! re-opened subscription picks up where it left off. Delivery into the sink
//! is non-blocking: when the buffer is full or `max_ack_pending` is reached,
//! the backlog is retried on the next publish, ack or subscribe.
//!
//! Every side effect is recorded for inspection in tests.

use crate::broker::{
    Acker, Broker, Delivery, DeliveryMetadata, SubscribeOptions, Subscription, SubscriptionInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use jobs::JobsError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct MemoryStream {
    subjects: Vec<String>,
    messages: BTreeMap<u64, Published>,
    last_sequence: u64,
    consumers: HashMap<String, MemoryConsumer>,
}

struct MemoryConsumer {
    filter: String,
    cursor: u64,
    max_ack_pending: usize,
    pending: BTreeSet<u64>,
    sink: Option<mpsc::Sender<Delivery>>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemoryStream>,
    published: Vec<Published>,
    responses: Vec<Published>,
    acked: Vec<u64>,
    naked: Vec<u64>,
    deleted_messages: Vec<(String, u64)>,
    deleted_streams: Vec<String>,
    subscribe_calls: usize,
    fail_deletes: bool,
    fail_publishes: bool,
    drained: bool,
    closed: bool,
}

/// In-memory [`Broker`] for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every message or stream delete fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }

    /// Make every stream publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// Deliver a message without stream metadata to every open subscription
    /// whose filter matches `subject`. Returns the number of receivers.
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        let mut delivered = 0;

        for stream in state.streams.values_mut() {
            for consumer in stream.consumers.values_mut() {
                if !subject_matches(&consumer.filter, subject) {
                    continue;
                }
                let Some(sink) = consumer.sink.as_ref() else {
                    continue;
                };
                let delivery = Delivery::without_metadata(
                    subject,
                    payload.clone(),
                    "message was not delivered by a stream consumer",
                    Arc::new(DetachedAcker),
                );
                if sink.try_send(delivery).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    /// Every successful stream publish, in order.
    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    /// Every core publish made through [`Broker::respond`].
    pub fn responses(&self) -> Vec<Published> {
        self.state.lock().responses.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acked.clone()
    }

    pub fn naked(&self) -> Vec<u64> {
        self.state.lock().naked.clone()
    }

    /// Attempted message deletes as `(stream, sequence)`, failed ones included.
    pub fn deleted_messages(&self) -> Vec<(String, u64)> {
        self.state.lock().deleted_messages.clone()
    }

    /// Attempted stream deletes, failed ones included.
    pub fn deleted_streams(&self) -> Vec<String> {
        self.state.lock().deleted_streams.clone()
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.state.lock().streams.contains_key(stream)
    }

    /// Messages currently stored in `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Number of open subscriptions across all streams.
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .streams
            .values()
            .flat_map(|s| s.consumers.values())
            .filter(|c| c.sink.is_some())
            .count()
    }

    /// Number of successful subscribe calls.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(state: &State) -> Result<(), JobsError> {
        if state.closed {
            return Err(JobsError::Broker("connection closed".to_string()));
        }
        Ok(())
    }

    fn pump_stream(shared: &Arc<Mutex<State>>, stream_name: &str, stream: &mut MemoryStream) {
        let MemoryStream {
            messages,
            consumers,
            ..
        } = stream;

        for (durable, consumer) in consumers.iter_mut() {
            let Some(sink) = consumer.sink.clone() else {
                continue;
            };

            for (&sequence, message) in messages.range(consumer.cursor + 1..) {
                if consumer.pending.len() >= consumer.max_ack_pending {
                    break;
                }
                if consumer.pending.contains(&sequence)
                    || !subject_matches(&consumer.filter, &message.subject)
                {
                    consumer.cursor = sequence;
                    continue;
                }

                let delivery = Delivery::new(
                    message.subject.clone(),
                    message.payload.clone(),
                    DeliveryMetadata {
                        stream_sequence: sequence,
                        delivered: 1,
                    },
                    Arc::new(MemoryAcker {
                        state: shared.clone(),
                        stream: stream_name.to_string(),
                        durable: durable.clone(),
                        sequence,
                    }),
                );

                match sink.try_send(delivery) {
                    Ok(()) => {
                        consumer.cursor = sequence;
                        consumer.pending.insert(sequence);
                    }
                    Err(TrySendError::Full(_)) => break,
                    Err(TrySendError::Closed(_)) => {
                        consumer.sink = None;
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_stream(&self, stream: &str, subjects: &[String]) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;

        state
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| MemoryStream {
                subjects: subjects.to_vec(),
                ..Default::default()
            });
        Ok(())
    }

    async fn subscribe(
        &self,
        options: &SubscribeOptions,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<Box<dyn Subscription>, JobsError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::check_open(state)?;

        let stream = state.streams.get_mut(&options.stream).ok_or_else(|| {
            JobsError::Subscribe(format!("stream not found: {}", options.stream))
        })?;

        let last_sequence = stream.last_sequence;
        let consumer = stream
            .consumers
            .entry(options.durable.clone())
            .or_insert_with(|| MemoryConsumer {
                filter: options.subject.clone(),
                cursor: if options.deliver_new { last_sequence } else { 0 },
                max_ack_pending: options.prefetch,
                pending: BTreeSet::new(),
                sink: None,
            });

        if consumer.sink.is_some() {
            return Err(JobsError::Subscribe(format!(
                "durable consumer {} already has an active subscription",
                options.durable
            )));
        }
        consumer.sink = Some(sink);
        state.subscribe_calls += 1;

        Self::pump_stream(&self.state, &options.stream, stream);

        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            stream: options.stream.clone(),
            durable: options.durable.clone(),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), JobsError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::check_open(state)?;

        if state.fail_publishes {
            return Err(JobsError::Publish("publish rejected".to_string()));
        }

        let (name, stream) = state
            .streams
            .iter_mut()
            .find(|(_, s)| s.subjects.iter().any(|f| subject_matches(f, subject)))
            .ok_or_else(|| JobsError::Publish(format!("no stream bound to {subject}")))?;

        let message = Published {
            subject: subject.to_string(),
            payload,
        };
        stream.last_sequence += 1;
        stream.messages.insert(stream.last_sequence, message.clone());
        state.published.push(message);

        let name = name.clone();
        Self::pump_stream(&self.state, &name, stream);
        Ok(())
    }

    async fn respond(&self, subject: &str, payload: Bytes) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;

        state.responses.push(Published {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;

        state.deleted_messages.push((stream.to_string(), sequence));
        if state.fail_deletes {
            return Err(JobsError::Delete(format!("delete of {stream}/{sequence} rejected")));
        }

        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.messages.remove(&sequence));

        match removed {
            Some(_) => Ok(()),
            None => Err(JobsError::Delete(format!("no message {sequence} in {stream}"))),
        }
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;

        state.deleted_streams.push(stream.to_string());
        if state.fail_deletes {
            return Err(JobsError::Delete(format!("delete of stream {stream} rejected")));
        }

        state
            .streams
            .remove(stream)
            .map(|_| ())
            .ok_or_else(|| JobsError::Delete(format!("stream not found: {stream}")))
    }

    async fn drain(&self) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.drained = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        state.closed = true;
        for consumer in state.streams.values_mut().flat_map(|s| s.consumers.values_mut()) {
            consumer.sink = None;
        }
        Ok(())
    }
}

struct MemorySubscription {
    state: Arc<Mutex<State>>,
    stream: String,
    durable: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn drain(&self) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        if let Some(consumer) = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable))
        {
            consumer.sink = None;
        }
        Ok(())
    }

    async fn info(&self) -> Result<SubscriptionInfo, JobsError> {
        let state = self.state.lock();
        let stream = state
            .streams
            .get(&self.stream)
            .ok_or_else(|| JobsError::Broker(format!("stream not found: {}", self.stream)))?;
        let consumer = stream
            .consumers
            .get(&self.durable)
            .ok_or_else(|| JobsError::Broker(format!("consumer not found: {}", self.durable)))?;

        let waiting = stream
            .messages
            .range(consumer.cursor + 1..)
            .filter(|(_, m)| subject_matches(&consumer.filter, &m.subject))
            .count();

        Ok(SubscriptionInfo {
            ack_pending: consumer.pending.len() as u64,
            waiting: waiting as u64,
        })
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    stream: String,
    durable: String,
    sequence: u64,
}

impl MemoryAcker {
    fn settle(&self, acked: bool) {
        let shared = self.state.clone();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if acked {
            state.acked.push(self.sequence);
        } else {
            state.naked.push(self.sequence);
        }

        if let Some(stream) = state.streams.get_mut(&self.stream) {
            if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
                consumer.pending.remove(&self.sequence);
                if !acked {
                    // Nak rewinds the cursor so the message is redelivered.
                    consumer.cursor = consumer.cursor.min(self.sequence - 1);
                }
            }
            MemoryBroker::pump_stream(&shared, &self.stream, stream);
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), JobsError> {
        self.settle(true);
        Ok(())
    }

    async fn nak(&self) -> Result<(), JobsError> {
        self.settle(false);
        Ok(())
    }
}

struct DetachedAcker;

#[async_trait]
impl Acker for DetachedAcker {
    async fn ack(&self) -> Result<(), JobsError> {
        Err(JobsError::Ack("message has no delivery metadata".to_string()))
    }

    async fn nak(&self) -> Result<(), JobsError> {
        Err(JobsError::Ack("message has no delivery metadata".to_string()))
    }
}

/// NATS subject matching: `*` matches one token, a trailing `>` the rest.
fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(prefetch: usize) -> SubscribeOptions {
        SubscribeOptions {
            subject: "jobs.a".to_string(),
            stream: "s1".to_string(),
            durable: "a".to_string(),
            deliver_new: false,
            rate_limit: 0,
            prefetch,
        }
    }

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("jobs.a", "jobs.a"));
        assert!(!subject_matches("jobs.a", "jobs.b"));
        assert!(subject_matches("jobs.*", "jobs.b"));
        assert!(!subject_matches("jobs.*", "jobs.b.c"));
        assert!(subject_matches("jobs.>", "jobs.b.c"));
        assert!(!subject_matches("jobs.>", "jobs"));
        assert!(!subject_matches("jobs.a.b", "jobs.a"));
    }

    #[tokio::test]
    async fn test_durable_cursor_survives_resubscribe() {
        let broker = MemoryBroker::new();
        broker.ensure_stream("s1", &["jobs.a".to_string()]).await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let sub = broker.subscribe(&options(10), tx.clone()).await.unwrap();
        broker.publish("jobs.a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"1"));

        sub.drain().await.unwrap();
        broker.publish("jobs.a", Bytes::from_static(b"2")).await.unwrap();
        assert!(rx.try_recv().is_err());

        let _sub = broker.subscribe(&options(10), tx).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"2"));
        assert_eq!(delivery.metadata().unwrap().stream_sequence, 2);
    }

    #[tokio::test]
    async fn test_max_ack_pending_holds_backlog_until_ack() {
        let broker = MemoryBroker::new();
        broker.ensure_stream("s1", &["jobs.a".to_string()]).await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let sub = broker.subscribe(&options(1), tx).await.unwrap();
        broker.publish("jobs.a", Bytes::from_static(b"1")).await.unwrap();
        broker.publish("jobs.a", Bytes::from_static(b"2")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(sub.info().await.unwrap().ack_pending, 1);
        assert_eq!(sub.info().await.unwrap().waiting, 1);

        first.acker().ack().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.metadata().unwrap().stream_sequence, 2);
        assert_eq!(broker.acked(), vec![1]);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = MemoryBroker::new();
        broker.ensure_stream("s1", &["jobs.a".to_string()]).await.unwrap();
        broker.close().await.unwrap();

        assert!(broker.is_closed());
        assert!(matches!(
            broker.publish("jobs.a", Bytes::new()).await,
            Err(JobsError::Broker(_))
        ));
    }
}
