//! Worker pool draining the dispatch queue

use async_trait::async_trait;
use eyre::{eyre, Result};
use jobs::{Item, PriorityQueue};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Executes one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, item: &Item) -> Result<()>;
}

/// Handler that logs each job and succeeds.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, item: &Item) -> Result<()> {
        info!(
            job_id = %item.id(),
            job = %item.name(),
            priority = item.priority(),
            payload_len = item.payload().len(),
            "Processing job"
        );
        Ok(())
    }
}

/// How a worker settled an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Naked,
    /// The settle call itself failed; the broker will redeliver
    Unsettled,
}

pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn JobHandler>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(queue: Arc<PriorityQueue>, handler: Arc<dyn JobHandler>, workers: usize) -> Self {
        Self {
            queue,
            handler,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. Each exits once `shutdown` flips to true, after
    /// finishing the item it holds.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(work(id, queue, handler, shutdown))
            })
            .collect()
    }
}

async fn work(
    id: usize,
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = queue.extract() => item,
        };

        process(handler.as_ref(), item).await;
    }

    debug!(worker = id, "Worker stopped");
}

/// Run the handler on one item and settle it.
///
/// Auto-ack items are acknowledged before the handler runs and are never
/// negatively acknowledged. Others are acked on success and nak'ed on
/// failure or timeout.
pub async fn process(handler: &dyn JobHandler, item: Item) -> Outcome {
    let auto_ack = item.auto_ack();
    let mut outcome = Outcome::Acked;

    if auto_ack {
        if let Err(e) = item.ack().await {
            warn!(job_id = %item.id(), error = %e, "Failed to auto-ack job");
            outcome = Outcome::Unsettled;
        }
    }

    let result = match item.job().timeout() {
        Some(limit) => tokio::time::timeout(limit, handler.handle(&item))
            .await
            .unwrap_or_else(|_| Err(eyre!("job timed out after {:?}", limit))),
        None => handler.handle(&item).await,
    };

    match result {
        Ok(()) => {
            if !auto_ack {
                if let Err(e) = item.ack().await {
                    warn!(job_id = %item.id(), error = %e, "Failed to ack job");
                    return Outcome::Unsettled;
                }
            }
            outcome
        }
        Err(e) => {
            error!(job_id = %item.id(), job = %item.name(), error = %e, "Job failed");
            if auto_ack {
                return outcome;
            }
            match item.nak().await {
                Ok(()) => Outcome::Naked,
                Err(e) => {
                    warn!(job_id = %item.id(), error = %e, "Failed to nak job");
                    Outcome::Unsettled
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::{DeliveryHandle, DispatchQueue, Job, JobsError};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Settled {
        calls: Mutex<Vec<&'static str>>,
        fail_ack: bool,
    }

    #[async_trait]
    impl DeliveryHandle for Settled {
        fn sequence(&self) -> u64 {
            1
        }

        async fn ack(&self) -> Result<(), JobsError> {
            self.calls.lock().push("ack");
            if self.fail_ack {
                return Err(JobsError::Ack("broker unavailable".to_string()));
            }
            Ok(())
        }

        async fn nak(&self) -> Result<(), JobsError> {
            self.calls.lock().push("nak");
            Ok(())
        }

        async fn requeue(&self, _job: &Job) -> Result<(), JobsError> {
            Ok(())
        }

        async fn respond(&self, _data: &[u8], _subject: &str) -> Result<(), JobsError> {
            Ok(())
        }
    }

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, _item: &Item) -> Result<()> {
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl JobHandler for Fail {
        async fn handle(&self, _item: &Item) -> Result<()> {
            Err(eyre!("boom"))
        }
    }

    struct Hang;

    #[async_trait]
    impl JobHandler for Hang {
        async fn handle(&self, _item: &Item) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn item(job: Job) -> (Item, Arc<Settled>) {
        let handle = Arc::new(Settled::default());
        (Item::new(job, handle.clone()), handle)
    }

    #[tokio::test]
    async fn test_success_acks() {
        let (item, handle) = item(Job::new("email", "x"));

        assert_eq!(process(&Succeed, item).await, Outcome::Acked);
        assert_eq!(*handle.calls.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_failure_naks() {
        let (item, handle) = item(Job::new("email", "x"));

        assert_eq!(process(&Fail, item).await, Outcome::Naked);
        assert_eq!(*handle.calls.lock(), vec!["nak"]);
    }

    #[tokio::test]
    async fn test_auto_ack_before_handler_and_never_nak() {
        let (item, handle) = item(Job::new("email", "x").with_auto_ack(true));

        assert_eq!(process(&Fail, item).await, Outcome::Acked);
        assert_eq!(*handle.calls.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_timeout_naks() {
        let (item, handle) = item(Job::new("email", "x").with_timeout(1));

        assert_eq!(process(&Hang, item).await, Outcome::Naked);
        assert_eq!(*handle.calls.lock(), vec!["nak"]);
    }

    #[tokio::test]
    async fn test_failed_ack_is_unsettled() {
        let handle = Arc::new(Settled {
            fail_ack: true,
            ..Default::default()
        });
        let item = Item::new(Job::new("email", "x"), handle);

        assert_eq!(process(&Succeed, item).await, Outcome::Unsettled);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = Arc::new(PriorityQueue::new());
        let handle = Arc::new(Settled::default());
        for i in 0..5 {
            queue.insert(Item::new(
                Job::new("email", format!("{i}")),
                handle.clone(),
            ));
        }

        let (tx, rx) = watch::channel(false);
        let workers = WorkerPool::new(queue.clone(), Arc::new(Succeed), 2).spawn(rx);

        for _ in 0..100 {
            if handle.calls.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.calls.lock().len(), 5);
        assert!(queue.is_empty());

        tx.send(true).unwrap();
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(1), worker)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
