//! Startup recovery: replay the WAL into the store, then reset it
//!
//! Runs to completion before the listener binds. Accepting traffic first
//! would advance the active segment and make the replay ambiguous, so a
//! failed replay load is fatal.

use crate::store::{LogStore, StoreError};
use crate::wal::{Wal, WalError, WalReader};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("wal scan failed: {0}")]
    Wal(#[from] WalError),
    #[error("recovered records could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// What a startup replay did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records found in the WAL.
    pub scanned: usize,
    /// Records newer than the store's high-water mark that were re-loaded.
    pub replayed: usize,
}

/// Replay WAL records the store has not seen, then reset the WAL.
///
/// The store's newest timestamp is the dividing line: anything at or below
/// it already survived a worker flush and must not be re-inserted.
pub async fn replay(wal: &Wal, store: &dyn LogStore) -> Result<RecoveryReport, RecoveryError> {
    let last_store_time = store.latest_timestamp().await?;

    let (records, stats) = WalReader::new(wal.dir()).recover()?;
    let mut report = RecoveryReport {
        scanned: records.len(),
        replayed: 0,
    };
    if stats.truncated_tails > 0 {
        warn!(
            truncated = stats.truncated_tails,
            "recovery found torn segment tails"
        );
    }

    let pending: Vec<_> = match last_store_time {
        Some(cutoff) => records
            .into_iter()
            .filter(|r| r.timestamp > cutoff)
            .collect(),
        None => records,
    };
    report.replayed = pending.len();

    if !pending.is_empty() {
        info!(records = pending.len(), "replaying unsaved wal records");
        store.bulk_load(&pending).await?;
    }

    wal.reset().await?;
    info!(
        scanned = report.scanned,
        replayed = report.replayed,
        "recovery complete"
    );
    Ok(report)
}
