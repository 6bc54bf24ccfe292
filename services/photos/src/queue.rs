use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned when enqueueing work
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue {0} has been shut down")]
    Closed(&'static str),
}

/// Bounded FIFO feeding a single dispatcher.
///
/// Producers wait while the queue is full. [`WorkQueue::close`] is terminal:
/// every later [`WorkQueue::push`] fails, and the receiving side sees the end
/// of the stream once the items already buffered have been taken.
pub struct WorkQueue<T> {
    name: &'static str,
    sender: RwLock<Option<mpsc::Sender<T>>>,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue and the receiver its dispatcher drains.
    ///
    /// A capacity of zero is raised to one.
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        (
            Self {
                name,
                sender: RwLock::new(Some(tx)),
                capacity,
            },
            rx,
        )
    }

    /// Enqueue an item, waiting for room if the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        // Clone out of the lock so a blocked producer never holds it.
        let sender = self
            .sender
            .read()
            .clone()
            .ok_or(QueueError::Closed(self.name))?;

        sender
            .send(item)
            .await
            .map_err(|_| QueueError::Closed(self.name))
    }

    /// Stop accepting items.
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items waiting to be dequeued.
    pub fn len(&self) -> usize {
        match self.sender.read().as_ref() {
            Some(sender) => sender.max_capacity() - sender.capacity(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_push_within_capacity_does_not_block() {
        let (queue, _rx) = WorkQueue::bounded("test", 3);

        for i in 0..3 {
            timeout(Duration::from_millis(100), queue.push(i))
                .await
                .expect("push within capacity should not block")
                .unwrap();
        }

        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_push_to_full_queue_waits_for_drain() {
        let (queue, mut rx) = WorkQueue::bounded("test", 1);
        queue.push(1).await.unwrap();

        assert!(timeout(Duration::from_millis(50), queue.push(2)).await.is_err());

        assert_eq!(rx.recv().await, Some(1));
        timeout(Duration::from_millis(100), queue.push(2))
            .await
            .expect("push should proceed after a drain")
            .unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut rx) = WorkQueue::bounded("test", 5);
        for i in 0..5 {
            queue.push(i).await.unwrap();
        }

        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_close_rejects_push_and_ends_stream() {
        let (queue, mut rx) = WorkQueue::bounded("test", 2);
        queue.push("buffered").await.unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.push("late").await, Err(QueueError::Closed("test")));

        assert_eq!(rx.recv().await, Some("buffered"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let (queue, _rx) = WorkQueue::<u8>::bounded("test", 0);
        assert_eq!(queue.capacity(), 1);
    }
}
