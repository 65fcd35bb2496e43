//! Bounded micro-batch queue between intake and the worker pool

use crate::metrics::PipelineMetrics;
use crate::record::LogRecord;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

/// The records of one client request, kept together for load efficiency.
pub type MicroBatch = Vec<LogRecord>;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Handed to a worker via the queue.
    Queued,
    /// Queue full; the batch stays only in the WAL and will surface through
    /// recovery on the next startup.
    Deferred,
}

/// Producer half, held by the intake handlers.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<MicroBatch>,
    metrics: Arc<PipelineMetrics>,
}

/// Consumer half, shared by all workers.
///
/// tokio's mpsc receiver is single-consumer, so the workers take turns on a
/// mutex; whichever worker holds it when a batch arrives gets the batch.
#[derive(Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<MicroBatch>>>,
    metrics: Arc<PipelineMetrics>,
}

/// Build the queue with the given capacity.
pub fn channel(capacity: usize, metrics: Arc<PipelineMetrics>) -> (IngestQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        IngestQueue {
            tx,
            metrics: metrics.clone(),
        },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
            metrics,
        },
    )
}

impl IngestQueue {
    /// Enqueue without blocking.
    ///
    /// The caller has already WAL'd the batch, so a full queue is not an
    /// error: the in-memory copy is dropped and the deferred counter bumped.
    pub fn enqueue(&self, batch: MicroBatch) -> Enqueue {
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.metrics.queued.inc();
                self.metrics.queue_depth.inc();
                Enqueue::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("ingest queue full, deferring batch to wal recovery");
                self.metrics.deferred.inc();
                Enqueue::Deferred
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Shutdown path: workers are gone, the WAL still has it.
                self.metrics.deferred.inc();
                Enqueue::Deferred
            }
        }
    }
}

impl QueueReceiver {
    /// Receive the next micro-batch; `None` once all producers are gone.
    pub async fn recv(&self) -> Option<MicroBatch> {
        let batch = self.rx.lock().await.recv().await;
        if batch.is_some() {
            self.metrics.queue_depth.dec();
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn batch(n: usize) -> MicroBatch {
        (0..n)
            .map(|i| LogRecord {
                timestamp: Utc::now(),
                level: "info".to_string(),
                message: format!("m{i}"),
                service: "svc".to_string(),
                project_id: 1,
                data: None,
                segment_id: 1,
            })
            .collect()
    }

    #[tokio::test]
    async fn enqueue_at_capacity_defers() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (queue, _rx) = channel(2, metrics.clone());

        assert_eq!(queue.enqueue(batch(1)), Enqueue::Queued);
        assert_eq!(queue.enqueue(batch(1)), Enqueue::Queued);
        assert_eq!(queue.enqueue(batch(1)), Enqueue::Deferred);
        assert_eq!(metrics.deferred.get(), 1);
        assert_eq!(metrics.queue_depth.get(), 2);
    }

    #[tokio::test]
    async fn receivers_drain_in_order() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (queue, rx) = channel(8, metrics.clone());

        queue.enqueue(batch(1));
        queue.enqueue(batch(2));

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        assert_eq!(rx.recv().await.unwrap().len(), 2);
        assert_eq!(metrics.queue_depth.get(), 0);
    }
}
