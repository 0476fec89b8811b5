//! Main WAL implementation.

use crate::entry::{WalEntry, WalRecord};
use crate::error::WalError;
use crate::recovery::RecoveryScanner;
use crate::segment::{Segment, SegmentId, SegmentScanner};
use crate::DEFAULT_SEGMENT_SIZE;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fsync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Fsync on the first write after N milliseconds have passed.
    EveryMs(u32),
    /// Never fsync automatically (caller must call sync).
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory to store WAL segments.
    pub dir: PathBuf,
    /// Maximum segment size before rotation.
    pub segment_size: u64,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Truncate torn records at segment tails when opening.
    pub repair_on_open: bool,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_policy: FsyncPolicy::default(),
            repair_on_open: true,
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_repair_on_open(mut self, repair: bool) -> Self {
        self.repair_on_open = repair;
        self
    }
}

/// Global WAL offset: (segment_id, offset_within_segment)
/// Encoded as a single u64: segment_id << 40 | offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalOffset(u64);

impl WalOffset {
    const OFFSET_BITS: u64 = 40;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    pub fn new(segment_id: SegmentId, offset: u64) -> Self {
        assert!(offset <= Self::OFFSET_MASK, "offset too large");
        Self((segment_id << Self::OFFSET_BITS) | offset)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.0 >> Self::OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// I/O statistics for the WAL.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    /// Total bytes written to WAL.
    pub bytes_written: u64,
    /// Total write operations.
    pub writes: u64,
    /// Total fsync operations.
    pub fsyncs: u64,
}

/// Write-Ahead Log.
pub struct Wal {
    config: WalConfig,
    /// Current segment for writing.
    current_segment: Mutex<Option<Segment>>,
    /// All segments, opened for reading.
    segments: RwLock<BTreeMap<SegmentId, Arc<Mutex<Segment>>>>,
    next_sequence: AtomicU64,
    /// Writes since last fsync (for EveryN policy).
    writes_since_sync: AtomicU64,
    /// Time of the last fsync (for EveryMs policy).
    last_sync: Mutex<Instant>,
    closed: AtomicBool,
    stats_bytes_written: AtomicU64,
    stats_writes: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl Wal {
    /// Opens or creates a WAL at the configured directory.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;

        if config.repair_on_open {
            let result = RecoveryScanner::new(&config.dir, config.segment_size).scan(true)?;
            if result.bytes_truncated > 0 {
                tracing::warn!(
                    "WAL repaired on open: truncated {} bytes in segments {:?}",
                    result.bytes_truncated,
                    result.segments_recovered
                );
            }
        }

        let wal = Self {
            config,
            current_segment: Mutex::new(None),
            segments: RwLock::new(BTreeMap::new()),
            next_sequence: AtomicU64::new(1),
            writes_since_sync: AtomicU64::new(0),
            last_sync: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            stats_bytes_written: AtomicU64::new(0),
            stats_writes: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        };

        wal.recover()?;

        Ok(wal)
    }

    /// Opens existing segments and restores the sequence counter.
    fn recover(&self) -> Result<(), WalError> {
        let segment_ids = SegmentScanner::list_segments(&self.config.dir)?;

        let latest_id = match segment_ids.last() {
            Some(&id) => id,
            None => return self.rotate_segment(&mut self.current_segment.lock()),
        };

        let mut max_sequence = 0u64;
        for &seg_id in &segment_ids {
            let mut segment = Segment::open(&self.config.dir, seg_id, self.config.segment_size)?;
            for (_, record) in segment.read_all()? {
                max_sequence = max_sequence.max(record.header.sequence);
            }
            self.segments
                .write()
                .insert(seg_id, Arc::new(Mutex::new(segment)));
        }

        self.next_sequence.store(max_sequence + 1, Ordering::SeqCst);
        *self.current_segment.lock() = Some(Segment::open(
            &self.config.dir,
            latest_id,
            self.config.segment_size,
        )?);

        tracing::info!(
            "WAL recovered: {} segments, next_sequence={}",
            segment_ids.len(),
            max_sequence + 1
        );

        Ok(())
    }

    /// Rotates to a new segment. The caller holds the current-segment lock.
    fn rotate_segment(&self, current: &mut Option<Segment>) -> Result<(), WalError> {
        let next_id = self
            .segments
            .read()
            .keys()
            .next_back()
            .map(|&id| id + 1)
            .unwrap_or(1);

        let segment = Segment::create(&self.config.dir, next_id, self.config.segment_size)?;
        let reader = Segment::open(&self.config.dir, next_id, self.config.segment_size)?;

        let mut segments = self.segments.write();
        // The sealed writer knows its final size; keep it for reads and stats.
        if let Some(sealed) = current.take() {
            segments.insert(sealed.id(), Arc::new(Mutex::new(sealed)));
        }
        segments.insert(next_id, Arc::new(Mutex::new(reader)));
        *current = Some(segment);

        tracing::debug!("Rotated to segment {}", next_id);
        Ok(())
    }

    /// Appends an entry to the WAL.
    ///
    /// Returns the assigned sequence number and the record's offset. When this
    /// returns an error the record must be treated as not written.
    pub fn append(&self, entry: &WalEntry) -> Result<(u64, WalOffset), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let payload = Bytes::from(serde_json::to_vec(entry)?);

        // Sequence numbers follow file order because both are assigned under this lock.
        let mut current = self.current_segment.lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord::new(entry.entry_type(), sequence, payload);
        let record_size = record.disk_size();

        let needs_rotation = match current.as_ref() {
            Some(segment) => !segment.can_fit(record_size),
            None => true,
        };
        if needs_rotation {
            self.rotate_segment(&mut current)?;
        }

        let segment = current.as_mut().ok_or(WalError::Closed)?;
        let segment_id = segment.id();
        let offset = segment.append(&record)?;

        self.stats_bytes_written
            .fetch_add(record_size as u64, Ordering::Relaxed);
        self.stats_writes.fetch_add(1, Ordering::Relaxed);

        let writes = self.writes_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        let sync_now = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writes >= u64::from(n),
            FsyncPolicy::EveryMs(ms) => {
                self.last_sync.lock().elapsed() >= Duration::from_millis(u64::from(ms))
            }
            FsyncPolicy::Never => false,
        };
        if sync_now {
            if let Err(e) = segment.sync() {
                // Not durable, so not committed: take the record back out.
                if let Err(truncate_err) = segment.truncate_at(offset) {
                    tracing::error!(
                        "Failed to roll back unsynced record in segment {}: {}",
                        segment_id,
                        truncate_err
                    );
                }
                return Err(e);
            }
            self.mark_synced();
        }

        Ok((sequence, WalOffset::new(segment_id, offset)))
    }

    fn mark_synced(&self) {
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        self.writes_since_sync.store(0, Ordering::Relaxed);
        *self.last_sync.lock() = Instant::now();
    }

    /// Forces a sync to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut current = self.current_segment.lock();
        if let Some(segment) = current.as_mut() {
            segment.sync()?;
            self.mark_synced();
        }
        Ok(())
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> WalStats {
        WalStats {
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            writes: self.stats_writes.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
        }
    }

    /// Returns the next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Reads every entry in the log, in append order.
    pub fn read_all(&self) -> Result<Vec<(u64, WalOffset, WalEntry)>, WalError> {
        let segments = self.segments.read();
        let mut results = Vec::new();

        for (&seg_id, segment) in segments.iter() {
            let records = segment.lock().read_all()?;
            for (offset, record) in records {
                let entry: WalEntry = serde_json::from_slice(&record.payload)?;
                results.push((
                    record.header.sequence,
                    WalOffset::new(seg_id, offset),
                    entry,
                ));
            }
        }

        Ok(results)
    }

    /// Closes the WAL. Later appends fail with [`WalError::Closed`].
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    /// Returns the list of segment IDs.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.read().keys().copied().collect()
    }

    /// Returns the total size of all segments in bytes.
    pub fn total_size(&self) -> u64 {
        match self.current_segment.lock().as_ref() {
            Some(current) => {
                let sealed: u64 = self
                    .segments
                    .read()
                    .iter()
                    .filter(|(&id, _)| id != current.id())
                    .map(|(_, s)| s.lock().size())
                    .sum();
                sealed + current.size()
            }
            None => self.segments.read().values().map(|s| s.lock().size()).sum(),
        }
    }
}
