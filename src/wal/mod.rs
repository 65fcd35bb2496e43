//! Write-ahead log: durability for accepted batches ahead of the store

pub mod reader;
pub mod segment;
pub mod writer;

pub use reader::{RecoveryStats, WalReader};
pub use segment::WalError;
pub use writer::{Wal, WalConfig};
