//! WAL recovery utilities.
//!
//! Handles recovery from:
//! - Torn writes (incomplete records at the end of a segment)
//! - Corrupted records

use crate::entry::WalRecord;
use crate::error::WalError;
use crate::segment::{Segment, SegmentId, SegmentScanner};
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BytesMut};
use std::path::{Path, PathBuf};

/// Result of WAL recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Number of corrupted records skipped over.
    pub invalid_records: u64,
    /// Bytes after the last valid record (truncated when repairing).
    pub bytes_truncated: u64,
    /// Segments that needed repair.
    pub segments_recovered: Vec<SegmentId>,
    /// Segments that could not be scanned.
    pub segments_with_errors: Vec<(SegmentId, String)>,
    /// Maximum sequence number found.
    pub max_sequence: u64,
}

impl RecoveryResult {
    /// Returns true if the scan found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.invalid_records == 0
            && self.bytes_truncated == 0
            && self.segments_with_errors.is_empty()
    }
}

/// Per-segment scan outcome.
struct SegmentScan {
    valid: u64,
    invalid: u64,
    truncated: u64,
    max_sequence: u64,
}

/// WAL recovery scanner.
pub struct RecoveryScanner {
    dir: PathBuf,
    segment_size: u64,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>, segment_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            segment_size,
        }
    }

    /// Scans and optionally repairs the WAL.
    pub fn scan(&self, repair: bool) -> Result<RecoveryResult, WalError> {
        let mut result = RecoveryResult::default();

        for seg_id in SegmentScanner::list_segments(&self.dir)? {
            match self.scan_segment(seg_id, repair) {
                Ok(scan) => {
                    result.valid_records += scan.valid;
                    result.invalid_records += scan.invalid;
                    result.bytes_truncated += scan.truncated;
                    result.max_sequence = result.max_sequence.max(scan.max_sequence);
                    if scan.invalid > 0 || scan.truncated > 0 {
                        result.segments_recovered.push(seg_id);
                    }
                }
                Err(e) => {
                    result.segments_with_errors.push((seg_id, e.to_string()));
                }
            }
        }

        Ok(result)
    }

    fn scan_segment(&self, seg_id: SegmentId, repair: bool) -> Result<SegmentScan, WalError> {
        let mut segment = Segment::open(&self.dir, seg_id, self.segment_size)?;
        let file_size = segment.size();

        let mut scan = SegmentScan {
            valid: 0,
            invalid: 0,
            truncated: 0,
            max_sequence: 0,
        };
        let mut last_valid_offset = 0u64;
        let mut offset = 0u64;

        let mut buf = BytesMut::from(&std::fs::read(segment.path())?[..]);

        while buf.len() >= RECORD_HEADER_SIZE {
            match WalRecord::decode(&mut buf, seg_id, offset) {
                Ok(Some(record)) => {
                    scan.valid += 1;
                    scan.max_sequence = scan.max_sequence.max(record.header.sequence);
                    offset += record.disk_size() as u64;
                    last_valid_offset = offset;
                }
                // Incomplete record at the end: a torn write
                Ok(None) => break,
                Err(WalError::CorruptedRecord { .. }) | Err(WalError::RecordTooLarge { .. }) => {
                    scan.invalid += 1;
                    buf.advance(1);
                    offset += 1;
                }
                Err(WalError::InvalidHeader { .. }) => {
                    if buf.iter().all(|&b| b == 0) {
                        break;
                    }
                    scan.invalid += 1;
                    buf.advance(1);
                    offset += 1;
                }
                Err(e) => return Err(e),
            }
        }

        scan.truncated = file_size - last_valid_offset;

        if repair && scan.truncated > 0 {
            segment.truncate_at(last_valid_offset)?;
            tracing::warn!(
                "Truncated segment {} at offset {} (removed {} bytes)",
                seg_id,
                last_valid_offset,
                scan.truncated
            );
        }

        Ok(scan)
    }
}

/// Verifies WAL integrity without modifying anything.
pub fn verify_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryResult, WalError> {
    RecoveryScanner::new(dir, segment_size).scan(false)
}

/// Repairs WAL by truncating torn writes.
pub fn repair_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryResult, WalError> {
    RecoveryScanner::new(dir, segment_size).scan(true)
}
