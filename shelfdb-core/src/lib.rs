//! # shelfdb-core
//!
//! Circulation engine for shelfdb.
//!
//! This crate provides:
//! - The catalog/ledger data model (copies, loans, money)
//! - Store contracts for copy availability and loan records
//! - A WAL-backed store with per-copy row locks
//! - The circulation engine: issue, return and overdue fines

pub mod clock;
pub mod engine;
pub mod error;
pub mod fine;
pub mod model;
pub mod store;
pub mod wal_store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{CirculationEngine, IssueReceipt, RetryPolicy, ReturnReceipt};
pub use error::{CirculationError, StoreError};
pub use fine::{days_overdue, LoanPolicy, Money, MoneyParseError};
pub use model::{
    Availability, BookCopy, CopyId, Loan, LoanId, MemberId, NewCopy, UnknownAvailability,
};
pub use store::{CatalogStore, CirculationStore, LedgerStore, StoreTxn};
pub use wal_store::{CopyStatus, StoreOptions, StoreStats, WalStore, WalTxn};
