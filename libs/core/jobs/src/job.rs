//! Jobs on the wire and items in flight.
//!
//! A [`Job`] is what producers publish and what the broker stores. An [`Item`]
//! is a decoded job together with the [`DeliveryHandle`] of the exact broker
//! message it came from; workers settle the message through the item.

use crate::error::JobsError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Job headers: multi-valued, like HTTP headers.
pub type Headers = HashMap<String, Vec<String>>;

/// A unit of work as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name, used by workers to pick the handler
    pub job: String,

    /// Unique job ID
    pub id: String,

    /// Opaque payload, passed to the handler untouched
    #[serde(default)]
    pub payload: String,

    /// Arbitrary headers
    #[serde(default)]
    pub headers: Headers,

    /// Scheduling options
    #[serde(default)]
    pub options: JobOptions,
}

/// Scheduling options attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Dispatch priority, lower values are handed to workers first
    #[serde(default)]
    pub priority: i64,

    /// Pipeline the job was pushed to
    #[serde(default)]
    pub pipeline: String,

    /// Delay in seconds before the job becomes visible
    #[serde(default)]
    pub delay: i64,

    /// Execution timeout in seconds (0 = no timeout)
    #[serde(default)]
    pub timeout: u64,

    /// Acknowledge as soon as a worker takes the job
    #[serde(default)]
    pub auto_ack: bool,
}

impl Job {
    /// Create a job with a fresh ID and default options.
    pub fn new(job: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers: Headers::new(),
            options: JobOptions::default(),
        }
    }

    /// Set the job ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    /// Set the target pipeline.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.options.pipeline = pipeline.into();
        self
    }

    /// Set the delay in seconds.
    pub fn with_delay(mut self, delay: i64) -> Self {
        self.options.delay = delay;
        self
    }

    /// Set the execution timeout in seconds.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Enable or disable auto-ack.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.options.auto_ack = auto_ack;
        self
    }

    /// Append a header value.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Whether the job asks for delayed delivery.
    pub fn is_delayed(&self) -> bool {
        self.options.delay > 0
    }

    /// Execution timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.options.timeout > 0).then(|| Duration::from_secs(self.options.timeout))
    }
}

/// Capability bound to one in-flight broker message.
///
/// Implementations are created by a job source when it decodes a message and
/// stay valid until the message is settled. Settling the same message twice is
/// the caller's responsibility to avoid.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// Broker stream sequence of the underlying message.
    fn sequence(&self) -> u64;

    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<(), JobsError>;

    /// Negative acknowledge, asking the broker to redeliver.
    async fn nak(&self) -> Result<(), JobsError>;

    /// Publish `job` again and drop the original message.
    async fn requeue(&self, job: &Job) -> Result<(), JobsError>;

    /// Publish `data` to an arbitrary reply subject.
    async fn respond(&self, data: &[u8], subject: &str) -> Result<(), JobsError>;
}

/// A decoded job waiting in the dispatch queue.
#[derive(Clone)]
pub struct Item {
    job: Job,
    handle: Arc<dyn DeliveryHandle>,
}

/// Execution context handed to job handlers alongside the payload.
#[derive(Debug, Serialize)]
struct ItemContext<'a> {
    id: &'a str,
    job: &'a str,
    pipeline: &'a str,
    headers: &'a Headers,
}

impl Item {
    /// Bind a decoded job to its delivery handle.
    pub fn new(job: Job, handle: Arc<dyn DeliveryHandle>) -> Self {
        Self { job, handle }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.job
    }

    pub fn payload(&self) -> &str {
        &self.job.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.job.headers
    }

    pub fn priority(&self) -> i64 {
        self.job.options.priority
    }

    pub fn auto_ack(&self) -> bool {
        self.job.options.auto_ack
    }

    /// Broker sequence of the message this item was decoded from.
    pub fn sequence(&self) -> u64 {
        self.handle.sequence()
    }

    /// Serialized execution context (id, job name, pipeline, headers).
    pub fn context(&self) -> Result<Vec<u8>, JobsError> {
        let ctx = ItemContext {
            id: &self.job.id,
            job: &self.job.job,
            pipeline: &self.job.options.pipeline,
            headers: &self.job.headers,
        };
        Ok(serde_json::to_vec(&ctx)?)
    }

    /// Acknowledge the underlying message.
    pub async fn ack(&self) -> Result<(), JobsError> {
        self.handle.ack().await
    }

    /// Negative acknowledge the underlying message.
    pub async fn nak(&self) -> Result<(), JobsError> {
        self.handle.nak().await
    }

    /// Publish the job again with extra headers and a new delay.
    ///
    /// Headers are merged into the existing ones; values for an existing key
    /// are replaced.
    pub async fn requeue(&self, headers: Headers, delay: i64) -> Result<(), JobsError> {
        let mut job = self.job.clone();
        job.headers.extend(headers);
        job.options.delay = delay;
        self.handle.requeue(&job).await
    }

    /// Publish a reply to `subject`.
    pub async fn respond(&self, data: &[u8], subject: &str) -> Result<(), JobsError> {
        self.handle.respond(data, subject).await
    }

    /// Drop the delivery handle and keep the job.
    pub fn into_job(self) -> Job {
        self.job
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("job", &self.job)
            .field("sequence", &self.handle.sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandle {
        requeued: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl DeliveryHandle for RecordingHandle {
        fn sequence(&self) -> u64 {
            7
        }

        async fn ack(&self) -> Result<(), JobsError> {
            Ok(())
        }

        async fn nak(&self) -> Result<(), JobsError> {
            Ok(())
        }

        async fn requeue(&self, job: &Job) -> Result<(), JobsError> {
            self.requeued.lock().push(job.clone());
            Ok(())
        }

        async fn respond(&self, _data: &[u8], _subject: &str) -> Result<(), JobsError> {
            Ok(())
        }
    }

    #[test]
    fn test_job_defaults_when_options_missing() {
        let job: Job = serde_json::from_str(r#"{"job":"email","id":"job-1"}"#).unwrap();

        assert_eq!(job.job, "email");
        assert_eq!(job.payload, "");
        assert!(job.headers.is_empty());
        assert_eq!(job.options, JobOptions::default());
        assert!(!job.is_delayed());
        assert_eq!(job.timeout(), None);
    }

    #[test]
    fn test_job_builder() {
        let job = Job::new("email", "{}")
            .with_priority(5)
            .with_pipeline("p1")
            .with_timeout(30)
            .with_header("trace", "abc")
            .with_header("trace", "def");

        assert_eq!(job.options.priority, 5);
        assert_eq!(job.options.pipeline, "p1");
        assert_eq!(job.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(job.headers["trace"], vec!["abc", "def"]);
        assert!(!job.id.is_empty());
    }

    #[tokio::test]
    async fn test_item_requeue_merges_headers_and_delay() {
        let handle = Arc::new(RecordingHandle::default());
        let job = Job::new("email", "payload").with_header("a", "1");
        let item = Item::new(job, handle.clone());

        let mut headers = Headers::new();
        headers.insert("b".to_string(), vec!["2".to_string()]);
        item.requeue(headers, 0).await.unwrap();

        let requeued = handle.requeued.lock();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].payload, "payload");
        assert_eq!(requeued[0].headers["a"], vec!["1"]);
        assert_eq!(requeued[0].headers["b"], vec!["2"]);
        assert_eq!(item.sequence(), 7);
    }

    #[test]
    fn test_item_context() {
        let job = Job::new("email", "payload")
            .with_id("job-1")
            .with_pipeline("p1");
        let item = Item::new(job, Arc::new(RecordingHandle::default()));

        let ctx: serde_json::Value = serde_json::from_slice(&item.context().unwrap()).unwrap();
        assert_eq!(ctx["id"], "job-1");
        assert_eq!(ctx["job"], "email");
        assert_eq!(ctx["pipeline"], "p1");
    }
}
