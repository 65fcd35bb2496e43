//! Worker pool: macro-batch accumulation and store flushes

use crate::hub::HubHandle;
use crate::ingest::queue::QueueReceiver;
use crate::metrics::PipelineMetrics;
use crate::record::LogRecord;
use crate::store::LogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    /// Records per macro-batch before an immediate flush.
    pub batch_size: usize,
    /// How long a partial macro-batch may wait before flushing.
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 25,
            batch_size: 5_000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// The pool of flush workers between the queue and the store.
pub struct IngestionEngine {
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl IngestionEngine {
    /// Spawn the workers. Each drains the shared queue into a private
    /// accumulator and flushes on size, timer, or cancellation.
    pub fn start(
        config: EngineConfig,
        queue: QueueReceiver,
        store: Arc<dyn LogStore>,
        hub: HubHandle,
        commit_tx: mpsc::Sender<u64>,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        info!(workers = config.worker_count, "starting ingestion engine");
        let workers = (0..config.worker_count)
            .map(|id| {
                let ctx = WorkerContext {
                    id,
                    config: config.clone(),
                    queue: queue.clone(),
                    store: store.clone(),
                    hub: hub.clone(),
                    commit_tx: commit_tx.clone(),
                    metrics: metrics.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(ctx.run())
            })
            .collect();
        Self { workers }
    }

    /// Wait for every worker to drain and exit. Call after cancelling the
    /// token the engine was started with.
    pub async fn shutdown(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("all ingestion workers drained");
    }
}

struct WorkerContext {
    id: usize,
    config: EngineConfig,
    queue: QueueReceiver,
    store: Arc<dyn LogStore>,
    hub: HubHandle,
    commit_tx: mpsc::Sender<u64>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn run(self) {
        let mut batch: Vec<LogRecord> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = interval(self.config.flush_interval);
        // interval's first tick completes at once; swallow it so the first
        // timer flush happens one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                received = self.queue.recv() => {
                    match received {
                        Some(micro) => {
                            batch.extend(micro);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            // All producers gone; drain and stop.
                            if !batch.is_empty() {
                                self.flush(&mut batch).await;
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = self.cancel.cancelled() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    debug!(worker = self.id, "worker stopped");
                    break;
                }
            }
        }
    }

    /// Load the macro-batch into the store, then fan out and report the
    /// commit watermark.
    ///
    /// A failed load drops the batch from memory: the records are still in
    /// the WAL, and because no commit is reported for them the janitor will
    /// not reclaim their segments, so the next startup replays them.
    async fn flush(&self, batch: &mut Vec<LogRecord>) {
        self.metrics.active_workers.inc();

        let result = self.store.bulk_load(batch).await;

        match result {
            Err(e) => {
                warn!(
                    worker = self.id,
                    records = batch.len(),
                    error = %e,
                    "macro-batch load failed, leaving records to wal recovery"
                );
                self.metrics.flush_errors.inc();
            }
            Ok(()) => {
                self.metrics.flushed.inc_by(batch.len() as u64);

                let max_seq = batch.iter().map(|r| r.segment_id).max().unwrap_or(0);

                for record in batch.drain(..) {
                    if !self.hub.broadcast(record) {
                        self.metrics.broadcast_drops.inc();
                    }
                }

                // Non-blocking: if the janitor's inbox is full, a later
                // batch will carry the watermark forward.
                if max_seq > 0 {
                    let _ = self.commit_tx.try_send(max_seq);
                }
            }
        }

        batch.clear();
        self.metrics.active_workers.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub;
    use crate::ingest::queue;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn micro(n: usize, segment_id: u64) -> Vec<LogRecord> {
        (0..n)
            .map(|i| LogRecord {
                timestamp: Utc::now(),
                level: "info".to_string(),
                message: format!("m{i}"),
                service: "svc".to_string(),
                project_id: 1,
                data: None,
                segment_id,
            })
            .collect()
    }

    struct Rig {
        queue: queue::IngestQueue,
        store: Arc<MemoryStore>,
        engine: IngestionEngine,
        commit_rx: mpsc::Receiver<u64>,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    }

    fn rig(config: EngineConfig) -> Rig {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = queue::channel(1_000, metrics.clone());
        let store = Arc::new(MemoryStore::new());
        let (hub, hub_handle) = hub::hub(metrics.clone(), cancel.clone());
        hub.spawn();
        let (commit_tx, commit_rx) = mpsc::channel(64);

        let engine = IngestionEngine::start(
            config,
            queue_rx,
            store.clone(),
            hub_handle,
            commit_tx,
            metrics.clone(),
            cancel.clone(),
        );

        Rig {
            queue: queue_tx,
            store,
            engine,
            commit_rx,
            metrics,
            cancel,
        }
    }

    #[tokio::test]
    async fn full_macro_batch_flushes_immediately() {
        let mut r = rig(EngineConfig {
            worker_count: 1,
            batch_size: 10,
            flush_interval: Duration::from_secs(3600),
        });

        r.queue.enqueue(micro(10, 3));

        let seq = tokio::time::timeout(Duration::from_secs(2), r.commit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(r.store.record_count(), 10);

        r.cancel.cancel();
        r.engine.shutdown().await;
    }

    #[tokio::test]
    async fn partial_batch_waits_for_the_timer() {
        let mut r = rig(EngineConfig {
            worker_count: 1,
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
        });

        r.queue.enqueue(micro(9, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Below batch size and before the timer: nothing flushed yet.
        assert_eq!(r.store.record_count(), 0);

        let seq = tokio::time::timeout(Duration::from_secs(2), r.commit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(r.store.record_count(), 9);

        r.cancel.cancel();
        r.engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_drains_the_accumulator() {
        let r = rig(EngineConfig {
            worker_count: 1,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(3600),
        });

        r.queue.enqueue(micro(42, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        r.cancel.cancel();
        r.engine.shutdown().await;
        assert_eq!(r.store.record_count(), 42);
    }

    #[tokio::test]
    async fn failed_flush_drops_from_memory_and_counts() {
        let r = rig(EngineConfig {
            worker_count: 1,
            batch_size: 5,
            flush_interval: Duration::from_millis(50),
        });

        r.store.set_fail_loads(true);
        r.queue.enqueue(micro(5, 2));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(r.store.record_count(), 0);
        assert!(r.metrics.flush_errors.get() >= 1);

        // The store heals; new records flow, the failed batch stays gone
        // from memory (recovery owns it).
        r.store.set_fail_loads(false);
        r.queue.enqueue(micro(5, 3));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(r.store.record_count(), 5);

        r.cancel.cancel();
        r.engine.shutdown().await;
    }

    #[tokio::test]
    async fn commit_watermark_is_the_batch_max() {
        let mut r = rig(EngineConfig {
            worker_count: 1,
            batch_size: 6,
            flush_interval: Duration::from_secs(3600),
        });

        let mut batch = micro(3, 4);
        batch.extend(micro(3, 2));
        r.queue.enqueue(batch);

        let seq = tokio::time::timeout(Duration::from_secs(2), r.commit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 4);

        r.cancel.cancel();
        r.engine.shutdown().await;
    }
}
