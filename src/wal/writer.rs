//! Segmented write-ahead log writer

use crate::record::LogRecord;
use crate::wal::segment::{self, WalError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// WAL writer configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Size past which the active segment is sealed and rotated.
    pub max_segment_size: u64,
    /// User-space write buffer size.
    pub buffer_size: usize,
    /// How often the background ticker fsyncs the active segment.
    pub sync_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            max_segment_size: 10 * 1024 * 1024, // 10MiB
            buffer_size: 64 * 1024,             // 64KiB
            sync_interval: Duration::from_millis(500),
        }
    }
}

/// Write-ahead log over a directory of append-only segments.
///
/// Every accepted batch is framed into the active segment before the HTTP
/// client is acknowledged. `write_batch` returns after the user-space buffer
/// is flushed to the file; durability to the platter is the sync ticker's
/// job, which bounds the crash-loss window to roughly one sync interval.
pub struct Wal {
    config: WalConfig,
    inner: Mutex<ActiveSegment>,
    // Mirror of the sequence owned by `inner`, so the janitor can read the
    // active sequence without contending on the write lock.
    active_seq: AtomicU64,
}

struct ActiveSegment {
    file: BufWriter<File>,
    seq: u64,
    size: u64,
}

impl ActiveSegment {
    fn open(config: &WalConfig, seq: u64) -> Result<Self, WalError> {
        let path = config.dir.join(segment::segment_file_name(seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        debug!(segment = seq, size, "opened wal segment");
        Ok(Self {
            file: BufWriter::with_capacity(config.buffer_size, file),
            seq,
            size,
        })
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

impl Wal {
    /// Open the WAL, resuming the highest existing segment or starting at 1.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        if !config.dir.exists() {
            std::fs::create_dir_all(&config.dir)
                .map_err(|e| WalError::Directory(e.to_string()))?;
            info!(dir = %config.dir.display(), "created wal directory");
        }

        let seq = segment::list_segments(&config.dir)?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(1)
            .max(1);

        let active = ActiveSegment::open(&config, seq)?;
        info!(dir = %config.dir.display(), segment = seq, "wal opened");
        Ok(Self {
            config,
            active_seq: AtomicU64::new(seq),
            inner: Mutex::new(active),
        })
    }

    /// Directory this WAL writes to.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Sequence number of the segment currently being written.
    pub fn active_seq(&self) -> u64 {
        self.active_seq.load(Ordering::Acquire)
    }

    /// Append a micro-batch to the active segment.
    ///
    /// Rotates first when the active segment is over size, stamps each record
    /// with the segment it lands in, and flushes the user-space buffer before
    /// returning. Returns the segment sequence the batch was written to.
    pub async fn write_batch(&self, records: &mut [LogRecord]) -> Result<u64, WalError> {
        let mut inner = self.inner.lock().await;

        if inner.size > self.config.max_segment_size {
            self.rotate(&mut inner)?;
        }

        for record in records.iter_mut() {
            record.segment_id = inner.seq;
            let frame = segment::encode_frame(record)?;
            inner.file.write_all(&frame)?;
            inner.size += frame.len() as u64;
        }
        inner.file.flush()?;

        Ok(inner.seq)
    }

    /// Fsync the active segment.
    ///
    /// Called by the sync ticker; many `write_batch` calls amortize into a
    /// single platter sync.
    pub async fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock().await;
        inner.flush_and_sync()
    }

    /// Delete every sealed segment with `seq <= max_seq`.
    ///
    /// The active segment is never deleted regardless of `max_seq`. Returns
    /// the number of files removed.
    pub async fn cleanup_until(&self, max_seq: u64) -> Result<usize, WalError> {
        let active = self.active_seq();
        let mut removed = 0;

        for (seq, path) in segment::list_segments(&self.config.dir)? {
            if seq > max_seq || seq >= active {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(segment = seq, "reclaimed wal segment");
                    removed += 1;
                }
                Err(e) => warn!(segment = seq, error = %e, "failed to remove wal segment"),
            }
        }

        Ok(removed)
    }

    /// Drop every segment and start over at sequence 1.
    ///
    /// Used after recovery has replayed the directory into the store.
    pub async fn reset(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock().await;
        inner.file.flush()?;

        for (seq, path) in segment::list_segments(&self.config.dir)? {
            std::fs::remove_file(&path)?;
            debug!(segment = seq, "removed wal segment on reset");
        }

        *inner = ActiveSegment::open(&self.config, 1)?;
        self.active_seq.store(1, Ordering::Release);
        info!("wal reset to segment 1");
        Ok(())
    }

    /// Flush, sync and close out the active segment.
    pub async fn close(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock().await;
        inner.flush_and_sync()?;
        info!(segment = inner.seq, "wal closed");
        Ok(())
    }

    /// Spawn the periodic fsync task. Exits on cancellation after one final
    /// sync.
    pub fn spawn_sync_ticker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let wal = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(wal.config.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = wal.sync().await {
                            error!(error = %e, "wal sync failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(e) = wal.sync().await {
                            error!(error = %e, "final wal sync failed");
                        }
                        debug!("wal sync ticker stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Seal the active segment and open the next one.
    fn rotate(&self, inner: &mut ActiveSegment) -> Result<(), WalError> {
        inner.flush_and_sync()?;
        let next = inner.seq + 1;
        *inner = ActiveSegment::open(&self.config, next)?;
        self.active_seq.store(next, Ordering::Release);
        info!(segment = next, "rotated wal segment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecord;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: "info".to_string(),
            message: message.to_string(),
            service: "svc".to_string(),
            project_id: 1,
            data: None,
            segment_id: 0,
        }
    }

    fn config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_batch_stamps_segment_id() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).unwrap();

        let mut batch = vec![record("a"), record("b")];
        let seq = wal.write_batch(&mut batch).await.unwrap();

        assert_eq!(seq, 1);
        assert!(batch.iter().all(|r| r.segment_id == 1));
    }

    #[tokio::test]
    async fn rotation_seals_past_max_size() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            dir: dir.path().to_path_buf(),
            max_segment_size: 64,
            ..Default::default()
        })
        .unwrap();

        let mut first = vec![record(&"x".repeat(200))];
        wal.write_batch(&mut first).await.unwrap();
        assert_eq!(first[0].segment_id, 1);

        // Over size now, so the next batch lands in segment 2.
        let mut second = vec![record("y")];
        wal.write_batch(&mut second).await.unwrap();
        assert_eq!(second[0].segment_id, 2);
        assert_eq!(wal.active_seq(), 2);

        assert!(dir.path().join("segment-000001.wal").exists());
        assert!(dir.path().join("segment-000002.wal").exists());
    }

    #[tokio::test]
    async fn open_resumes_highest_segment() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(WalConfig {
                dir: dir.path().to_path_buf(),
                max_segment_size: 16,
                ..Default::default()
            })
            .unwrap();
            wal.write_batch(&mut vec![record(&"x".repeat(64))])
                .await
                .unwrap();
            wal.write_batch(&mut vec![record("next")]).await.unwrap();
            wal.close().await.unwrap();
        }

        let wal = Wal::open(config(&dir)).unwrap();
        assert_eq!(wal.active_seq(), 2);
    }

    #[tokio::test]
    async fn cleanup_never_touches_active_segment() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            dir: dir.path().to_path_buf(),
            max_segment_size: 1,
            ..Default::default()
        })
        .unwrap();

        for i in 0..4 {
            wal.write_batch(&mut vec![record(&format!("m{i}"))])
                .await
                .unwrap();
        }
        assert_eq!(wal.active_seq(), 4);

        // Ask for more than exists; the active segment must survive.
        let removed = wal.cleanup_until(10).await.unwrap();
        assert_eq!(removed, 3);
        assert!(!dir.path().join("segment-000001.wal").exists());
        assert!(dir.path().join("segment-000004.wal").exists());
    }

    #[tokio::test]
    async fn reset_returns_to_segment_one() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            dir: dir.path().to_path_buf(),
            max_segment_size: 1,
            ..Default::default()
        })
        .unwrap();

        for _ in 0..3 {
            wal.write_batch(&mut vec![record("m")]).await.unwrap();
        }
        assert_eq!(wal.active_seq(), 3);

        wal.reset().await.unwrap();
        assert_eq!(wal.active_seq(), 1);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("segment-000001.wal")]);
    }
}
