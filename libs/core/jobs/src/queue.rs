//! Dispatch queue shared between job sources and the worker pool.

use crate::job::Item;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;

/// Insertion side of the queue that feeds workers.
///
/// Job sources only ever insert; ordering and removal belong to the queue.
/// Implementations must be safe for concurrent producers and must not block
/// the caller indefinitely.
pub trait DispatchQueue: Send + Sync {
    /// Hand an item over to the worker pool.
    fn insert(&self, item: Item);
}

struct Entry {
    priority: i64,
    seq: u64,
    item: Item,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap pops the greatest entry: lowest priority value, then oldest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Unbounded in-process priority queue.
///
/// Lower `priority` values are extracted first; items with equal priority
/// come out in insertion order.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<Heap>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the next item without waiting.
    pub fn try_extract(&self) -> Option<Item> {
        self.heap.lock().entries.pop().map(|entry| entry.item)
    }

    /// Remove the next item, waiting until one is inserted.
    pub async fn extract(&self) -> Item {
        loop {
            if let Some(item) = self.try_extract() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

impl DispatchQueue for PriorityQueue {
    fn insert(&self, item: Item) {
        {
            let mut heap = self.heap.lock();
            let seq = heap.next_seq;
            heap.next_seq += 1;
            heap.entries.push(Entry {
                priority: item.priority(),
                seq,
                item,
            });
        }
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobsError;
    use crate::job::{DeliveryHandle, Job};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoopHandle;

    #[async_trait]
    impl DeliveryHandle for NoopHandle {
        fn sequence(&self) -> u64 {
            0
        }
        async fn ack(&self) -> Result<(), JobsError> {
            Ok(())
        }
        async fn nak(&self) -> Result<(), JobsError> {
            Ok(())
        }
        async fn requeue(&self, _job: &Job) -> Result<(), JobsError> {
            Ok(())
        }
        async fn respond(&self, _data: &[u8], _subject: &str) -> Result<(), JobsError> {
            Ok(())
        }
    }

    fn item(id: &str, priority: i64) -> Item {
        Item::new(
            Job::new("test", "").with_id(id).with_priority(priority),
            Arc::new(NoopHandle),
        )
    }

    #[test]
    fn test_lower_priority_value_first() {
        let queue = PriorityQueue::new();
        queue.insert(item("a", 5));
        queue.insert(item("b", 1));
        queue.insert(item("c", 2));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_extract().unwrap().id(), "b");
        assert_eq!(queue.try_extract().unwrap().id(), "c");
        assert_eq!(queue.try_extract().unwrap().id(), "a");
        assert!(queue.try_extract().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = PriorityQueue::new();
        for id in ["first", "second", "third"] {
            queue.insert(item(id, 3));
        }

        assert_eq!(queue.try_extract().unwrap().id(), "first");
        assert_eq!(queue.try_extract().unwrap().id(), "second");
        assert_eq!(queue.try_extract().unwrap().id(), "third");
    }

    #[tokio::test]
    async fn test_extract_waits_for_insert() {
        let queue = Arc::new(PriorityQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.extract().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.insert(item("late", 1));

        let extracted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("extract should wake up")
            .unwrap();
        assert_eq!(extracted.id(), "late");
    }
}
