//! Errors raised while appending to, reading, or scanning the log.

use crate::segment::SegmentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stored and computed checksums of a record disagree.
    #[error(
        "checksum mismatch in segment {segment} at byte {offset}: stored {expected:#010x}, computed {actual:#010x}"
    )]
    CorruptedRecord {
        segment: SegmentId,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("unreadable record header in segment {segment} at byte {offset}: {reason}")]
    InvalidHeader {
        segment: SegmentId,
        offset: u64,
        reason: String,
    },

    #[error("unknown log entry type {0}")]
    UnknownEntryType(u8),

    #[error("record payload of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error("log is closed to new records")]
    Closed,

    #[error("record payload is not a circulation entry: {0}")]
    Json(#[from] serde_json::Error),
}

impl WalError {
    /// I/O failures may clear up on their own; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }

    /// Returns true when the bytes on disk are at fault rather than the device.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            WalError::CorruptedRecord { .. }
                | WalError::InvalidHeader { .. }
                | WalError::UnknownEntryType(_)
                | WalError::Json(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            WalError::Io(_) => "WAL_IO_ERROR",
            WalError::CorruptedRecord { .. }
            | WalError::InvalidHeader { .. }
            | WalError::UnknownEntryType(_)
            | WalError::Json(_) => "WAL_CORRUPT",
            WalError::RecordTooLarge { .. } => "WAL_RECORD_TOO_LARGE",
            WalError::Closed => "WAL_CLOSED",
        }
    }
}
