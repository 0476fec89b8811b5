//! WAL entry types.
//!
//! Each WAL record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | sequence_number     | payload                                   |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```

use crate::error::WalError;
use crate::segment::SegmentId;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Magic bytes for WAL records: "SLOG"
pub const WAL_MAGIC: [u8; 4] = *b"SLOG";

/// Maximum record payload size (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Type of WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Copy added to the catalog.
    AddCopy = 1,
    /// Availability change committed together with a ledger write.
    Transition = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::AddCopy),
            2 => Ok(WalEntryType::Transition),
            _ => Err(WalError::UnknownEntryType(value)),
        }
    }
}

/// A parsed WAL record header.
#[derive(Debug, Clone)]
pub struct WalRecordHeader {
    pub entry_type: WalEntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub sequence: u64,
}

/// A complete WAL record (header + payload).
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: Bytes,
}

impl WalRecord {
    /// Creates a new WAL record.
    pub fn new(entry_type: WalEntryType, sequence: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            header: WalRecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc,
                sequence,
            },
            payload,
        }
    }

    /// Encodes the record into bytes.
    pub fn encode(&self) -> Result<BytesMut, WalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&WAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.sequence);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a record read from `segment` at byte `offset`.
    ///
    /// Returns `Ok(None)` when the buffer holds less than one full record, or
    /// when it starts with zero padding.
    pub fn decode(
        buf: &mut BytesMut,
        segment: SegmentId,
        offset: u64,
    ) -> Result<Option<Self>, WalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != WAL_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                segment,
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let entry_type = WalEntryType::try_from(buf[4]).map_err(|e| WalError::InvalidHeader {
            segment,
            offset,
            reason: e.to_string(),
        })?;

        let flags = buf[5];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sequence = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        // Checked before consuming, so a corrupt record leaves the buffer intact.
        let crc_actual =
            crc32c::crc32c(&buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len]);
        if crc_actual != crc_expected {
            return Err(WalError::CorruptedRecord {
                segment,
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            header: WalRecordHeader {
                entry_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                sequence,
            },
            payload,
        }))
    }

    /// Returns the total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// Ledger half of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerChange {
    OpenLoan {
        loan_id: u64,
        member_id: String,
        issue_date: NaiveDate,
        due_date: NaiveDate,
    },
    CloseLoan {
        loan_id: u64,
        return_date: NaiveDate,
        fine_cents: i64,
    },
}

impl LedgerChange {
    /// Returns the loan this change writes.
    pub fn loan_id(&self) -> u64 {
        match self {
            LedgerChange::OpenLoan { loan_id, .. } | LedgerChange::CloseLoan { loan_id, .. } => {
                *loan_id
            }
        }
    }
}

/// Typed WAL entry with deserialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalEntry {
    AddCopy {
        copy_id: String,
        title: String,
        author: String,
        category: String,
    },
    /// The catalog write and the ledger write of one transaction.
    Transition {
        copy_id: String,
        availability: String,
        ledger: LedgerChange,
    },
}

impl WalEntry {
    /// Returns the entry type for this entry.
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::AddCopy { .. } => WalEntryType::AddCopy,
            WalEntry::Transition { .. } => WalEntryType::Transition,
        }
    }

    /// Returns the copy this entry belongs to.
    pub fn copy_id(&self) -> &str {
        match self {
            WalEntry::AddCopy { copy_id, .. } | WalEntry::Transition { copy_id, .. } => copy_id,
        }
    }
}
