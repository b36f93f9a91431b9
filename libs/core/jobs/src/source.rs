//! The capability every pipeline driver implements.

use crate::error::JobsError;
use crate::job::Job;
use crate::pipeline::{Pipeline, PipelineState};
use async_trait::async_trait;

/// A broker-backed source of jobs bound to one pipeline.
///
/// A pipeline manager drives sources through this trait only, selecting the
/// implementation by [`Pipeline::driver`]. Lifecycle calls are serialized by
/// the implementation; callers may invoke them concurrently.
///
/// # Lifecycle
///
/// ```text
/// Created ──register──▶ Registered ──run──▶ Running ⇄ Paused
///                                              │         │
///                                              └──stop───┴──▶ Stopped
/// ```
///
/// # Example
///
/// ```rust,ignore
/// let source: Arc<dyn JobSource> = Arc::new(consumer);
/// source.register(pipeline.clone()).await?;
/// source.run(&pipeline).await?;
///
/// source.push(Job::new("email", payload)).await?;
///
/// source.pause(pipeline.name()).await?;
/// source.resume(pipeline.name()).await?;
/// source.stop().await?;
/// ```
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Bind a pipeline descriptor. Fails while the source is running.
    async fn register(&self, pipeline: Pipeline) -> Result<(), JobsError>;

    /// Subscribe and start delivering into the dispatch queue.
    ///
    /// Returns an error when `pipeline` is not the registered one or when a
    /// listener is already active.
    async fn run(&self, pipeline: &Pipeline) -> Result<(), JobsError>;

    /// Stop delivery while keeping broker-side acknowledgement state.
    ///
    /// Pausing a source with no active listener is a no-op.
    async fn pause(&self, pipeline: &str) -> Result<(), JobsError>;

    /// Restart delivery after [`pause`](Self::pause).
    ///
    /// Resuming a running source is a no-op.
    async fn resume(&self, pipeline: &str) -> Result<(), JobsError>;

    /// Terminate delivery and release the broker connection.
    ///
    /// Safe to call more than once.
    async fn stop(&self) -> Result<(), JobsError>;

    /// Snapshot of the pipeline.
    async fn state(&self) -> Result<PipelineState, JobsError>;

    /// Publish a job to the pipeline.
    async fn push(&self, job: Job) -> Result<(), JobsError>;
}
