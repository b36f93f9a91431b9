//! NATS JetStream job source.

use crate::broker::{Broker, Delivery, SubscribeOptions, Subscription};
use crate::client::NatsBroker;
use crate::config::{resolve_config, resolve_pipeline, ConsumerConfig, NatsConfig, PipelineConfig};
use crate::delivery::Route;
use crate::listener::Listener;
use crate::metrics::JobsMetrics;
use async_trait::async_trait;
use jobs::{DispatchQueue, Job, JobSource, JobsError, Pipeline, PipelineState};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Lifecycle of a consumer.
///
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Created,
    Registered,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Created => "created",
            ConsumerState::Registered => "registered",
            ConsumerState::Running => "running",
            ConsumerState::Paused => "paused",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything mutated by Run/Pause/Resume/Stop, guarded by one lock.
struct Lifecycle {
    state: ConsumerState,
    subscription: Option<Arc<dyn Subscription>>,
    stop: Option<watch::Sender<bool>>,
    listener: Option<JoinHandle<mpsc::Receiver<Delivery>>>,
    buffer_tx: mpsc::Sender<Delivery>,
    // Present whenever no listener owns it.
    buffer_rx: Option<mpsc::Receiver<Delivery>>,
}

/// Durable consumer binding one pipeline to a JetStream stream.
///
/// Messages flow broker → bounded local buffer (`prefetch` slots) → listener
/// task → dispatch queue. Acknowledgement state lives in a durable broker
/// consumer, so pausing and resuming neither loses nor replays acknowledged
/// work.
///
/// # Example
///
/// ```rust,ignore
/// let queue = Arc::new(PriorityQueue::new());
/// let consumer = NatsConsumer::from_pipeline(&pipeline, Some(&nats), queue.clone()).await?;
///
/// consumer.register(pipeline.clone()).await?;
/// consumer.run(&pipeline).await?;
///
/// let item = queue.extract().await;
/// item.ack().await?;
///
/// consumer.stop().await?;
/// ```
pub struct NatsConsumer {
    broker: Arc<dyn Broker>,
    queue: Arc<dyn DispatchQueue>,
    config: PipelineConfig,
    route: Arc<Route>,
    pipeline: RwLock<Option<Pipeline>>,
    lifecycle: Mutex<Lifecycle>,
    metrics: JobsMetrics,
}

impl NatsConsumer {
    /// Connect for a pipeline declared at runtime.
    pub async fn from_pipeline(
        pipeline: &Pipeline,
        global: Option<&NatsConfig>,
        queue: Arc<dyn DispatchQueue>,
    ) -> Result<Self, JobsError> {
        let config = resolve_pipeline(global, pipeline)?;
        let broker = NatsBroker::connect(&config.addr).await?;
        Self::with_broker(Arc::new(broker), config, queue).await
    }

    /// Connect for a pipeline declared under `key` in a configuration tree.
    pub async fn from_config(
        key: &str,
        source: &Value,
        queue: Arc<dyn DispatchQueue>,
    ) -> Result<Self, JobsError> {
        let config = resolve_config(key, source)?;
        let broker = NatsBroker::connect(&config.addr).await?;
        Self::with_broker(Arc::new(broker), config, queue).await
    }

    /// Build on an existing broker, creating the stream when it is missing.
    pub async fn with_broker(
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        queue: Arc<dyn DispatchQueue>,
    ) -> Result<Self, JobsError> {
        let ConsumerConfig { name, pipeline, .. } = config;
        pipeline.validate()?;

        broker
            .ensure_stream(&pipeline.stream, &[pipeline.subject.clone()])
            .await?;

        let metrics = JobsMetrics::new(&name);
        let route = Arc::new(Route {
            broker: broker.clone(),
            subject: pipeline.subject.clone(),
            stream: pipeline.stream.clone(),
            delete_after_ack: pipeline.delete_after_ack,
            metrics: metrics.clone(),
        });

        let (buffer_tx, buffer_rx) = mpsc::channel(pipeline.prefetch);

        Ok(Self {
            broker,
            queue,
            config: pipeline,
            route,
            pipeline: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: ConsumerState::Created,
                subscription: None,
                stop: None,
                listener: None,
                buffer_tx,
                buffer_rx: Some(buffer_rx),
            }),
            metrics,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn lifecycle_state(&self) -> ConsumerState {
        self.lifecycle.lock().await.state
    }

    /// Number of active listener tasks: 1 while running, 0 otherwise.
    pub async fn listener_count(&self) -> usize {
        usize::from(self.lifecycle.lock().await.state == ConsumerState::Running)
    }

    fn registered(&self) -> Result<Pipeline, JobsError> {
        self.pipeline.read().clone().ok_or(JobsError::NotRegistered)
    }

    fn check_name(&self, requested: &str) -> Result<Pipeline, JobsError> {
        let pipeline = self.registered()?;
        if pipeline.name() != requested {
            error!(requested = %requested, registered = %pipeline.name(), "no such pipeline");
            return Err(JobsError::mismatch(requested, pipeline.name()));
        }
        Ok(pipeline)
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            subject: self.config.subject.clone(),
            stream: self.config.stream.clone(),
            durable: self.config.durable.clone(),
            deliver_new: self.config.deliver_new,
            rate_limit: self.config.rate_limit,
            prefetch: self.config.prefetch,
        }
    }

    /// Subscribe and spawn the listener. Leaves the lifecycle untouched on
    /// failure.
    async fn start_listener(&self, lc: &mut Lifecycle) -> Result<(), JobsError> {
        let subscription = self
            .broker
            .subscribe(&self.subscribe_options(), lc.buffer_tx.clone())
            .await?;

        let Some(buffer) = lc.buffer_rx.take() else {
            if let Err(e) = subscription.drain().await {
                error!(error = %e, "drain error");
            }
            return Err(JobsError::AlreadyRunning(self.config.durable.clone()));
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = Listener {
            route: self.route.clone(),
            queue: self.queue.clone(),
        };

        lc.listener = Some(tokio::spawn(listener.run(buffer, stop_rx)));
        lc.stop = Some(stop_tx);
        lc.subscription = Some(Arc::from(subscription));
        self.metrics.listener_active(true);
        Ok(())
    }

    /// Drain the subscription, signal the listener and wait for it to hand
    /// the buffer back. Drain failures are logged only.
    async fn stop_listener(&self, lc: &mut Lifecycle) {
        if let Some(subscription) = lc.subscription.take() {
            if let Err(e) = subscription.drain().await {
                error!(error = %e, "drain error");
            }
        }

        if let Some(stop) = lc.stop.take() {
            // Fails only when the listener has already exited.
            let _ = stop.send(true);
        }

        if let Some(listener) = lc.listener.take() {
            match listener.await {
                Ok(buffer) => lc.buffer_rx = Some(buffer),
                Err(e) => {
                    // Buffered messages are lost with the task; the broker
                    // redelivers them after the ack wait.
                    error!(error = %e, "listener task failed");
                    let (tx, rx) = mpsc::channel(self.config.prefetch);
                    lc.buffer_tx = tx;
                    lc.buffer_rx = Some(rx);
                }
            }
        }

        self.metrics.listener_active(false);
    }
}

#[async_trait]
impl JobSource for NatsConsumer {
    async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError> {
        let mut lc = self.lifecycle.lock().await;

        match lc.state {
            ConsumerState::Running => {
                return Err(JobsError::AlreadyRunning(pipeline.name().to_string()))
            }
            ConsumerState::Stopped => return Err(JobsError::Stopped(pipeline.name().to_string())),
            ConsumerState::Created => lc.state = ConsumerState::Registered,
            ConsumerState::Registered | ConsumerState::Paused => {}
        }

        debug!(pipeline = %pipeline.name(), driver = %pipeline.driver(), "pipeline registered");
        *self.pipeline.write() = Some(pipeline);
        Ok(())
    }

    async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError> {
        let start = Instant::now();
        let mut lc = self.lifecycle.lock().await;
        let registered = self.check_name(pipeline.name())?;

        match lc.state {
            ConsumerState::Running => {
                warn!(pipeline = %registered.name(), "listener already active");
                return Err(JobsError::AlreadyRunning(registered.name().to_string()));
            }
            ConsumerState::Stopped => {
                return Err(JobsError::Stopped(registered.name().to_string()))
            }
            _ => {}
        }

        self.start_listener(&mut lc).await?;
        lc.state = ConsumerState::Running;

        let elapsed = start.elapsed();
        self.metrics.transition("run", elapsed);
        debug!(
            driver = %registered.driver(),
            pipeline = %registered.name(),
            elapsed_ms = elapsed.as_millis() as u64,
            "pipeline started"
        );
        Ok(())
    }

    async fn pause(&self, pipeline: &str) -> Result<(), JobsError> {
        let start = Instant::now();
        let mut lc = self.lifecycle.lock().await;
        let registered = self.check_name(pipeline)?;

        if lc.state != ConsumerState::Running {
            warn!(pipeline = %pipeline, "no active listeners, nothing to pause");
            return Ok(());
        }

        self.stop_listener(&mut lc).await;
        lc.state = ConsumerState::Paused;

        let elapsed = start.elapsed();
        self.metrics.transition("pause", elapsed);
        debug!(
            driver = %registered.driver(),
            pipeline = %registered.name(),
            elapsed_ms = elapsed.as_millis() as u64,
            "pipeline paused"
        );
        Ok(())
    }

    async fn resume(&self, pipeline: &str) -> Result<(), JobsError> {
        let start = Instant::now();
        let mut lc = self.lifecycle.lock().await;
        let registered = self.check_name(pipeline)?;

        match lc.state {
            ConsumerState::Running => {
                warn!(pipeline = %pipeline, "listener already active");
                return Ok(());
            }
            ConsumerState::Stopped => return Err(JobsError::Stopped(pipeline.to_string())),
            _ => {}
        }

        self.start_listener(&mut lc).await.inspect_err(|e| {
            error!(pipeline = %pipeline, error = %e, "failed to resume pipeline");
        })?;
        lc.state = ConsumerState::Running;

        let elapsed = start.elapsed();
        self.metrics.transition("resume", elapsed);
        debug!(
            driver = %registered.driver(),
            pipeline = %registered.name(),
            elapsed_ms = elapsed.as_millis() as u64,
            "pipeline resumed"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), JobsError> {
        let start = Instant::now();
        let mut lc = self.lifecycle.lock().await;

        if lc.state == ConsumerState::Stopped {
            debug!(stream = %self.config.stream, "already stopped");
            return Ok(());
        }

        if lc.state == ConsumerState::Running {
            self.stop_listener(&mut lc).await;
        }
        lc.state = ConsumerState::Stopped;

        let mut first_error = None;

        if self.config.delete_stream_on_stop {
            if let Err(e) = self.broker.delete_stream(&self.config.stream).await {
                error!(stream = %self.config.stream, error = %e, "failed to delete stream");
                first_error = Some(e);
            }
        }

        if let Err(e) = self.broker.drain().await {
            error!(error = %e, "connection drain error");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.broker.close().await {
            error!(error = %e, "connection close error");
            first_error.get_or_insert(e);
        }

        let elapsed = start.elapsed();
        self.metrics.transition("stop", elapsed);
        let pipeline = self.pipeline.read().clone();
        debug!(
            driver = pipeline.as_ref().map(|p| p.driver()).unwrap_or_default(),
            pipeline = pipeline.as_ref().map(|p| p.name()).unwrap_or_default(),
            elapsed_ms = elapsed.as_millis() as u64,
            "pipeline stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn state(&self) -> Result<PipelineState, JobsError> {
        let pipeline = self.registered()?;

        // Broker round-trips happen outside the lifecycle lock.
        let (ready, subscription) = {
            let lc = self.lifecycle.lock().await;
            (lc.state == ConsumerState::Running, lc.subscription.clone())
        };

        let mut state = PipelineState {
            pipeline: pipeline.name().to_string(),
            driver: pipeline.driver().to_string(),
            queue: self.config.subject.clone(),
            ready,
            ..Default::default()
        };

        if let Some(subscription) = subscription {
            let info = subscription.info().await?;
            state.active = info.ack_pending as i64;
            state.reserved = info.waiting as i64;
            state.delayed = 0;
        }

        Ok(state)
    }

    async fn push(&self, mut job: Job) -> Result<(), JobsError> {
        if job.options.pipeline.is_empty() {
            if let Some(pipeline) = self.pipeline.read().as_ref() {
                job.options.pipeline = pipeline.name().to_string();
            }
        }

        self.route.publish(&job).await?;
        self.metrics.pushed();
        Ok(())
    }
}
