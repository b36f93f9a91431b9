//! Pipeline manager: selects a job source by driver and drives its lifecycle

use jobs::{DispatchQueue, JobSource, JobsError, Pipeline, PipelineState};
use nats_jobs::{NatsConfig, NatsConsumer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Supported pipeline drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Nats,
}

impl FromStr for Driver {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            nats_jobs::DRIVER => Ok(Driver::Nats),
            other => Err(JobsError::Configuration(format!(
                "unknown pipeline driver: {other}"
            ))),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::Nats => f.write_str(nats_jobs::DRIVER),
        }
    }
}

/// Build the job source for `pipeline`'s driver.
pub async fn connect(
    pipeline: &Pipeline,
    nats: &NatsConfig,
    queue: Arc<dyn DispatchQueue>,
) -> Result<Arc<dyn JobSource>, JobsError> {
    match pipeline.driver().parse::<Driver>()? {
        Driver::Nats => {
            let consumer = NatsConsumer::from_pipeline(pipeline, Some(nats), queue).await?;
            Ok(Arc::new(consumer))
        }
    }
}

/// Owns one running pipeline.
pub struct PipelineManager {
    source: Arc<dyn JobSource>,
    pipeline: Pipeline,
}

impl PipelineManager {
    /// Register and run `pipeline` on `source`.
    pub async fn start(source: Arc<dyn JobSource>, pipeline: Pipeline) -> Result<Self, JobsError> {
        let start = Instant::now();

        source.register(pipeline.clone()).await?;
        source.run(&pipeline).await?;

        info!(
            pipeline = %pipeline.name(),
            driver = %pipeline.driver(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pipeline started"
        );

        Ok(Self { source, pipeline })
    }

    pub fn source(&self) -> Arc<dyn JobSource> {
        self.source.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn pause(&self) -> Result<(), JobsError> {
        self.source.pause(self.pipeline.name()).await
    }

    pub async fn resume(&self) -> Result<(), JobsError> {
        self.source.resume(self.pipeline.name()).await
    }

    pub async fn state(&self) -> Result<PipelineState, JobsError> {
        self.source.state().await
    }

    /// Stop the source and release its broker connection.
    pub async fn shutdown(self) -> Result<(), JobsError> {
        match self.source.stop().await {
            Ok(()) => {
                info!(pipeline = %self.pipeline.name(), "Pipeline stopped");
                Ok(())
            }
            Err(e) => {
                warn!(pipeline = %self.pipeline.name(), error = %e, "Pipeline stopped with errors");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::PriorityQueue;
    use nats_jobs::{resolve_pipeline, Broker, MemoryBroker};

    fn pipeline() -> Pipeline {
        Pipeline::new("emails", "nats")
            .with("subject", "jobs.emails")
            .with("stream", "emails")
            .with("prefetch", 10)
    }

    async fn memory_source(broker: &MemoryBroker) -> Arc<dyn JobSource> {
        let config = resolve_pipeline(Some(&NatsConfig::new("nats://memory")), &pipeline()).unwrap();
        let broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let consumer = NatsConsumer::with_broker(broker, config, Arc::new(PriorityQueue::new()))
            .await
            .unwrap();
        Arc::new(consumer)
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!("nats".parse::<Driver>().unwrap(), Driver::Nats);
        assert_eq!("NATS".parse::<Driver>().unwrap(), Driver::Nats);
        assert!(matches!(
            "amqp".parse::<Driver>(),
            Err(JobsError::Configuration(_))
        ));
        assert_eq!(Driver::Nats.to_string(), "nats");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_driver() {
        let pipeline = Pipeline::new("emails", "sqs");
        let result = connect(
            &pipeline,
            &NatsConfig::new("nats://127.0.0.1:4222"),
            Arc::new(PriorityQueue::new()),
        )
        .await;

        assert!(matches!(result, Err(JobsError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_start_pause_resume_shutdown() {
        let broker = MemoryBroker::new();
        let source = memory_source(&broker).await;

        let manager = PipelineManager::start(source, pipeline()).await.unwrap();
        assert!(manager.state().await.unwrap().ready);
        assert_eq!(broker.active_subscriptions(), 1);

        manager.pause().await.unwrap();
        assert!(!manager.state().await.unwrap().ready);
        manager.resume().await.unwrap();
        assert!(manager.state().await.unwrap().ready);

        manager.shutdown().await.unwrap();
        assert_eq!(broker.active_subscriptions(), 0);
        assert!(broker.is_closed());
    }
}
