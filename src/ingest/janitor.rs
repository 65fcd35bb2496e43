//! Segment janitor: reclaims WAL segments behind the commit watermark

use crate::wal::Wal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the commit-event channel. Workers send non-blocking; a full
/// inbox just means a later batch reports a higher watermark.
const COMMIT_BUFFER: usize = 1_024;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub sweep_interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Build the commit channel workers report flush acknowledgements on.
pub fn commit_channel() -> (mpsc::Sender<u64>, mpsc::Receiver<u64>) {
    mpsc::channel(COMMIT_BUFFER)
}

/// Owns the commit watermark. The watermark only ever moves forward, and a
/// sweep never deletes the active segment regardless of the watermark.
pub struct SegmentJanitor {
    wal: Arc<Wal>,
    commit_rx: mpsc::Receiver<u64>,
    config: JanitorConfig,
    cancel: CancellationToken,
    max_safe_seq: u64,
}

impl SegmentJanitor {
    pub fn new(
        wal: Arc<Wal>,
        commit_rx: mpsc::Receiver<u64>,
        config: JanitorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            wal,
            commit_rx,
            config,
            cancel,
            max_safe_seq: 0,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("segment janitor started");
        let mut ticker = interval(self.config.sweep_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                committed = self.commit_rx.recv() => {
                    match committed {
                        Some(seq) => self.max_safe_seq = self.max_safe_seq.max(seq),
                        None => break,
                    }
                }
                _ = ticker.tick() => self.sweep().await,
                _ = self.cancel.cancelled() => break,
            }
        }
        info!(watermark = self.max_safe_seq, "segment janitor stopped");
    }

    async fn sweep(&self) {
        let threshold = self
            .max_safe_seq
            .min(self.wal.active_seq().saturating_sub(1));
        if threshold == 0 {
            return;
        }

        match self.wal.cleanup_until(threshold).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, threshold, "reclaimed wal segments"),
            Err(e) => warn!(error = %e, "wal cleanup failed"),
        }
    }
}
