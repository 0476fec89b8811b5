//! WAL segment management.
//!
//! The log is split into size-bounded segments:
//! - Rotation: New segment when the current one cannot fit the next record
//! - Recovery: Segments can be scanned and repaired independently

use crate::entry::WalRecord;
use crate::error::WalError;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier (monotonically increasing).
pub type SegmentId = u64;

/// Segment file name format: NNNNNNNNNNNNNNNN.wal (16 hex digits)
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:016x}.wal", id)
}

/// Parse segment ID from filename.
pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let name = name.strip_suffix(".wal")?;
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// A single WAL segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    sync_pending: bool,
}

impl Segment {
    /// Creates a new segment file.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            sync_pending: false,
        })
    }

    /// Opens an existing segment file for reading and appending.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            sync_pending: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether the segment can fit a record of the given size.
    ///
    /// An empty segment accepts any record so oversized records still land
    /// somewhere instead of rotating forever.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size == 0 || self.size + record_size as u64 <= self.max_size
    }

    /// Appends a record to the segment, returning its offset.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let encoded = record.encode()?;
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        if let Err(e) = self.file.write_all(&encoded) {
            // Drop whatever prefix of the record reached the file.
            if let Err(truncate_err) = self.truncate_at(offset) {
                tracing::error!(
                    "Failed to truncate segment {} after short write: {}",
                    self.id,
                    truncate_err
                );
            }
            return Err(WalError::Io(e));
        }
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) -> File {
        std::mem::replace(&mut self.file, file)
    }

    /// Syncs the segment to disk.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Reads all complete records from the segment.
    pub fn read_all(&mut self) -> Result<Vec<(u64, WalRecord)>, WalError> {
        let mut records = Vec::new();
        let mut offset = 0u64;

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            while buf.len() >= RECORD_HEADER_SIZE {
                match WalRecord::decode(&mut buf, self.id, offset)? {
                    Some(record) => {
                        let record_size = record.disk_size();
                        records.push((offset, record));
                        offset += record_size as u64;
                    }
                    None => break,
                }
            }
        }

        Ok(records)
    }

    /// Truncates the segment at the given offset.
    ///
    /// Drops a torn tail on recovery, and takes back a record whose write or
    /// sync failed.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        self.sync_pending = false;
        Ok(())
    }
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists all segment IDs in a directory, sorted ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = parse_segment_filename(&name.to_string_lossy()) {
                segments.push(id);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::WalEntryType;
    use crate::DEFAULT_SEGMENT_SIZE;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_segment_filename() {
        assert_eq!(segment_filename(0), "0000000000000000.wal");
        assert_eq!(segment_filename(255), "00000000000000ff.wal");
        assert_eq!(parse_segment_filename("00000000000000ff.wal"), Some(255));
        assert_eq!(parse_segment_filename("invalid.wal"), None);
        assert_eq!(parse_segment_filename("0000000000000000.txt"), None);
    }

    #[test]
    fn test_segment_read_all() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();

        for i in 0..5 {
            let record = WalRecord::new(
                WalEntryType::AddCopy,
                i,
                Bytes::from(format!(r#"{{"seq":{}}}"#, i)),
            );
            segment.append(&record).unwrap();
        }
        segment.sync().unwrap();

        let records = segment.read_all().unwrap();
        assert_eq!(records.len(), 5);
        for (i, (_, record)) in records.iter().enumerate() {
            assert_eq!(record.header.sequence, i as u64);
        }
    }

    #[test]
    fn test_can_fit_empty_segment() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 1, 16).unwrap();
        assert!(segment.can_fit(1024));
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = TempDir::new().unwrap();
        for id in [3, 1, 2] {
            Segment::create(dir.path(), id, DEFAULT_SEGMENT_SIZE).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let ids = SegmentScanner::list_segments(dir.path()).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    fn record(sequence: u64) -> WalRecord {
        WalRecord::new(
            WalEntryType::AddCopy,
            sequence,
            Bytes::from(format!(r#"{{"copy":{}}}"#, sequence)),
        )
    }

    #[test]
    fn test_truncate_at_discards_rolled_back_record() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();

        segment.append(&record(0)).unwrap();
        let rolled_back = segment.append(&record(1)).unwrap();
        segment.truncate_at(rolled_back).unwrap();

        assert_eq!(segment.size(), rolled_back);
        let records = segment.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.header.sequence, 0);

        // The next record takes the freed space, with no gap.
        assert_eq!(segment.append(&record(2)).unwrap(), rolled_back);
        segment.sync().unwrap();
        drop(segment);

        let mut reopened = Segment::open(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();
        let sequences: Vec<u64> = reopened
            .read_all()
            .unwrap()
            .iter()
            .map(|(_, r)| r.header.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 2]);
    }

    #[test]
    fn test_failed_write_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();
        segment.append(&record(0)).unwrap();
        segment.sync().unwrap();
        let size = segment.size();

        // A read-only handle makes every write fail.
        let read_only = File::open(segment.path()).unwrap();
        let writable = segment.replace_file(read_only);
        assert!(matches!(segment.append(&record(1)), Err(WalError::Io(_))));
        assert_eq!(segment.size(), size);

        segment.replace_file(writable);
        assert_eq!(segment.read_all().unwrap().len(), 1);
        assert_eq!(segment.append(&record(2)).unwrap(), size);
        segment.sync().unwrap();
        drop(segment);

        let mut reopened = Segment::open(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();
        let sequences: Vec<u64> = reopened
            .read_all()
            .unwrap()
            .iter()
            .map(|(_, r)| r.header.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 2]);
    }
}
