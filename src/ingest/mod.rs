//! Ingestion pipeline: queue, worker pool, segment janitor, recovery

pub mod engine;
pub mod janitor;
pub mod queue;
pub mod recovery;

pub use engine::{EngineConfig, IngestionEngine};
pub use janitor::{commit_channel, JanitorConfig, SegmentJanitor};
pub use queue::{Enqueue, IngestQueue, MicroBatch, QueueReceiver};
pub use recovery::{replay, RecoveryError, RecoveryReport};
