//! # shelfdb-wal
//!
//! Write-ahead log for shelfdb.
//!
//! Every committed circulation transition is a single record in this log, so a
//! copy's availability change and the loan write that goes with it become
//! durable together or not at all. The log provides:
//! - Per-record checksums for corruption detection
//! - Segment-based file management
//! - Configurable fsync policies
//! - Recovery from torn writes at the tail

pub mod entry;
pub mod error;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use entry::{LedgerChange, WalEntry, WalEntryType, WalRecord};
pub use error::WalError;
pub use recovery::{repair_wal, verify_wal, RecoveryResult};
pub use segment::{Segment, SegmentId};
pub use wal::{FsyncPolicy, Wal, WalConfig, WalOffset, WalStats};

/// Default segment size (16 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// WAL record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;
