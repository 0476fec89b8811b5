//! Store contracts used by the circulation engine.
//!
//! The engine reads and writes exactly two things: the availability of a copy
//! (catalog) and the loan records that reference it (ledger). A
//! [`CirculationStore`] runs one catalog write and one ledger write for a
//! single copy as an atomic unit.

use crate::error::StoreError;
use crate::fine::Money;
use crate::model::{Availability, CopyId, Loan, LoanId, MemberId};
use chrono::NaiveDate;

/// Catalog side: the availability field of a copy.
pub trait CatalogStore {
    fn get_availability(&self, copy_id: &CopyId) -> Result<Availability, StoreError>;

    fn set_availability(
        &mut self,
        copy_id: &CopyId,
        availability: Availability,
    ) -> Result<(), StoreError>;
}

/// Ledger side: loan records.
pub trait LedgerStore {
    fn create_loan(
        &mut self,
        copy_id: &CopyId,
        member_id: &MemberId,
        issue_date: NaiveDate,
        due_date: NaiveDate,
    ) -> Result<LoanId, StoreError>;

    /// Returns the loan for `copy_id` that has no return date, if any.
    fn find_open_loan(&self, copy_id: &CopyId) -> Result<Option<Loan>, StoreError>;

    fn close_loan(
        &mut self,
        loan_id: LoanId,
        return_date: NaiveDate,
        fine: Money,
    ) -> Result<(), StoreError>;
}

/// Both halves, as seen from inside a transaction.
pub trait StoreTxn: CatalogStore + LedgerStore {}

impl<T: CatalogStore + LedgerStore + ?Sized> StoreTxn for T {}

/// A store that can run catalog and ledger writes for one copy atomically.
pub trait CirculationStore: Send + Sync {
    /// Runs `f` with exclusive access to `copy_id`.
    ///
    /// Writes made through the transaction handle become visible only if `f`
    /// returns `Ok` and the commit succeeds. Any other exit, including a panic
    /// inside `f`, discards them. Fails with [`StoreError::CopyNotFound`]
    /// before calling `f` when the copy is not in the catalog.
    fn transaction<T, E, F>(&self, copy_id: &CopyId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T, E>,
        E: From<StoreError>;
}
