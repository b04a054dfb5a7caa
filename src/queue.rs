use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Unbounded FIFO of job ids shared by every producer and worker.
///
/// Each id pushed is handed to exactly one `pop` caller.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Uuid>,
    rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    depth: AtomicUsize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, id: Uuid) -> OrchestratorResult<()> {
        self.depth.fetch_add(1, Ordering::SeqCst);

        self.tx.send(id).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            OrchestratorError::QueueClosed
        })
    }

    /// Waits until an id is available. Consumers are served one at a time, so
    /// FIFO order holds across workers.
    pub async fn pop(&self) -> Option<Uuid> {
        let id = self.rx.lock().await.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = JobQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            queue.push(*id).unwrap();
        }
        assert_eq!(queue.len(), 5);

        for id in &ids {
            assert_eq!(queue.pop().await, Some(*id));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pop_waits_for_a_producer() {
        let queue = Arc::new(JobQueue::new());
        let id = Uuid::new_v4();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!consumer.is_finished());

        queue.push(id).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn each_id_is_delivered_once() {
        let queue = Arc::new(JobQueue::new());
        for _ in 0..20 {
            queue.push(Uuid::new_v4()).unwrap();
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    seen.extend(queue.pop().await);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
