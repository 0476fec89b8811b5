//! WAL-backed catalog and ledger store.
//!
//! Every copy lives in its own row behind a mutex. A transaction holds the
//! row lock for its whole duration, stages its writes, and on commit appends
//! a single `Transition` record carrying both the availability change and the
//! ledger change. Rows are only touched after that append succeeds, so a
//! failed commit leaves memory and disk exactly as they were.

use crate::error::StoreError;
use crate::fine::Money;
use crate::model::{Availability, BookCopy, CopyId, Loan, LoanId, MemberId, NewCopy};
use crate::store::{CatalogStore, CirculationStore, LedgerStore, StoreTxn};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use shelfdb_wal::{LedgerChange, Wal, WalConfig, WalEntry, WalStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for [`WalStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// How long a transaction waits for a copy's row lock.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
        }
    }
}

impl StoreOptions {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// A copy together with its open loan, read under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatus {
    pub copy: BookCopy,
    pub open_loan: Option<Loan>,
}

/// Aggregate counters over the whole store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub copies: usize,
    pub issued: usize,
    pub open_loans: usize,
    pub closed_loans: usize,
    pub fines_assessed: Money,
    pub next_sequence: u64,
    pub wal: WalStats,
}

/// In-memory state of one copy.
#[derive(Debug)]
struct CopyRow {
    copy: BookCopy,
    open_loan: Option<Loan>,
    /// Closed loans, oldest first.
    history: Vec<Loan>,
}

impl CopyRow {
    fn new(copy: BookCopy) -> Self {
        Self {
            copy,
            open_loan: None,
            history: Vec::new(),
        }
    }

    /// Checks that a transition keeps availability and open loans in step.
    fn validate(&self, availability: Availability, change: &LedgerChange) -> Result<(), String> {
        match change {
            LedgerChange::OpenLoan {
                loan_id,
                issue_date,
                due_date,
                ..
            } => {
                if let Some(open) = &self.open_loan {
                    return Err(format!(
                        "copy {} already has open loan {}",
                        self.copy.id, open.id
                    ));
                }
                if availability != Availability::Issued {
                    return Err(format!(
                        "opening loan {} must mark copy {} issued",
                        loan_id, self.copy.id
                    ));
                }
                if due_date < issue_date {
                    return Err(format!(
                        "loan {} is due ({}) before it is issued ({})",
                        loan_id, due_date, issue_date
                    ));
                }
            }
            LedgerChange::CloseLoan {
                loan_id,
                return_date,
                fine_cents,
            } => {
                let open = match &self.open_loan {
                    Some(open) if open.id.get() == *loan_id => open,
                    _ => {
                        return Err(format!(
                            "loan {} is not open on copy {}",
                            loan_id, self.copy.id
                        ))
                    }
                };
                if availability != Availability::Available {
                    return Err(format!(
                        "closing loan {} must mark copy {} available",
                        loan_id, self.copy.id
                    ));
                }
                if *fine_cents < 0 {
                    return Err(format!("loan {} has a negative fine", loan_id));
                }
                if *return_date < open.issue_date {
                    return Err(format!(
                        "loan {} is returned ({}) before it is issued ({})",
                        loan_id, return_date, open.issue_date
                    ));
                }
            }
        }
        Ok(())
    }

    /// Applies a validated transition.
    fn apply(&mut self, availability: Availability, change: LedgerChange) {
        self.copy.availability = availability;
        match change {
            LedgerChange::OpenLoan {
                loan_id,
                member_id,
                issue_date,
                due_date,
            } => {
                self.open_loan = Some(Loan {
                    id: LoanId::new(loan_id),
                    copy_id: self.copy.id.clone(),
                    member_id: MemberId::new(member_id),
                    issue_date,
                    due_date,
                    return_date: None,
                    fine: Money::ZERO,
                });
            }
            LedgerChange::CloseLoan {
                return_date,
                fine_cents,
                ..
            } => {
                if let Some(mut loan) = self.open_loan.take() {
                    loan.return_date = Some(return_date);
                    loan.fine = Money::from_cents(fine_cents);
                    self.history.push(loan);
                }
            }
        }
    }

    fn loans(&self) -> impl Iterator<Item = &Loan> {
        self.history.iter().chain(self.open_loan.iter())
    }
}

/// Catalog and ledger rows, made durable through a write-ahead log.
pub struct WalStore {
    wal: Arc<Wal>,
    rows: DashMap<CopyId, Arc<Mutex<CopyRow>>>,
    /// Which copy each loan belongs to.
    loan_index: DashMap<LoanId, CopyId>,
    next_loan_id: AtomicU64,
    /// Next number handed out to generated copy ids.
    next_copy_number: AtomicU64,
    /// Serializes catalog additions.
    catalog_lock: Mutex<()>,
    options: StoreOptions,
}

impl WalStore {
    /// Opens the WAL at the configured directory and rebuilds all rows from it.
    pub fn open(config: WalConfig, options: StoreOptions) -> Result<Self, StoreError> {
        let wal = Arc::new(Wal::open(config)?);
        Self::with_wal(wal, options)
    }

    /// Builds a store over an already opened WAL.
    pub fn with_wal(wal: Arc<Wal>, options: StoreOptions) -> Result<Self, StoreError> {
        let store = Self {
            wal,
            rows: DashMap::new(),
            loan_index: DashMap::new(),
            next_loan_id: AtomicU64::new(1),
            next_copy_number: AtomicU64::new(1),
            catalog_lock: Mutex::new(()),
            options,
        };

        store.replay_wal()?;

        Ok(store)
    }

    fn replay_wal(&self) -> Result<(), StoreError> {
        let entries = self.wal.read_all()?;
        let entry_count = entries.len();

        for (sequence, _offset, entry) in entries {
            self.replay_entry(sequence, entry)?;
        }

        if entry_count > 0 {
            tracing::info!(
                "WAL replay complete: {} entries, {} copies, {} loans",
                entry_count,
                self.rows.len(),
                self.loan_index.len()
            );
        }

        Ok(())
    }

    fn replay_entry(&self, sequence: u64, entry: WalEntry) -> Result<(), StoreError> {
        let corrupt = |reason: String| StoreError::CorruptEntry { sequence, reason };

        match entry {
            WalEntry::AddCopy {
                copy_id,
                title,
                author,
                category,
            } => {
                let id = CopyId::new(copy_id);
                if self.rows.contains_key(&id) {
                    return Err(corrupt(format!("copy {} added twice", id)));
                }
                self.insert_row(BookCopy {
                    id,
                    title,
                    author,
                    category,
                    availability: Availability::Available,
                });
            }

            WalEntry::Transition {
                copy_id,
                availability,
                ledger,
            } => {
                let id = CopyId::new(copy_id);
                let row = self
                    .row(&id)
                    .ok_or_else(|| corrupt(format!("transition on unknown copy {}", id)))?;
                let availability: Availability =
                    availability.parse().map_err(|e| corrupt(format!("{}", e)))?;

                let mut row = row.lock();
                row.validate(availability, &ledger).map_err(corrupt)?;

                let loan_id = ledger.loan_id();
                self.loan_index.insert(LoanId::new(loan_id), id);
                self.next_loan_id.fetch_max(loan_id + 1, Ordering::SeqCst);
                row.apply(availability, ledger);
            }
        }

        Ok(())
    }

    fn row(&self, copy_id: &CopyId) -> Option<Arc<Mutex<CopyRow>>> {
        self.rows.get(copy_id).map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of every row handle, so no map shard stays locked while rows are.
    fn all_rows(&self) -> Vec<Arc<Mutex<CopyRow>>> {
        self.rows.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Runs `f` on a copy's row while holding its lock.
    fn with_row<R>(
        &self,
        copy_id: &CopyId,
        f: impl FnOnce(&mut CopyRow) -> R,
    ) -> Result<R, StoreError> {
        let row = self.row(copy_id).ok_or_else(|| StoreError::CopyNotFound {
            copy_id: copy_id.clone(),
        })?;
        let mut guard =
            row.try_lock_for(self.options.lock_timeout)
                .ok_or_else(|| StoreError::LockTimeout {
                    copy_id: copy_id.clone(),
                })?;
        Ok(f(&mut *guard))
    }

    fn insert_row(&self, copy: BookCopy) {
        if let Some(n) = copy.id.number() {
            self.next_copy_number
                .fetch_max(n.saturating_add(1), Ordering::SeqCst);
        }
        self.rows
            .insert(copy.id.clone(), Arc::new(Mutex::new(CopyRow::new(copy))));
    }

    // =========================================================================
    // Catalog Maintenance
    // =========================================================================

    /// Adds one copy to the catalog.
    pub fn add_copy(&self, new_copy: NewCopy) -> Result<BookCopy, StoreError> {
        let _catalog = self.catalog_lock.lock();
        self.insert_copy(new_copy)
    }

    /// Adds `quantity` copies of one title under generated numeric ids.
    ///
    /// Copies are logged one by one; if a later one fails, the earlier ones
    /// stay in the catalog.
    pub fn add_copies(
        &self,
        title: &str,
        author: &str,
        category: Option<&str>,
        quantity: u32,
    ) -> Result<Vec<BookCopy>, StoreError> {
        if quantity == 0 {
            return Err(StoreError::InvalidInput {
                reason: "quantity must be at least 1".to_string(),
            });
        }

        let _catalog = self.catalog_lock.lock();
        let mut added = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            let id = self.next_free_copy_id();
            let mut new_copy = NewCopy::new(id, title, author);
            if let Some(category) = category {
                new_copy = new_copy.with_category(category);
            }
            added.push(self.insert_copy(new_copy)?);
        }

        tracing::info!("Added {} copies of '{}'", added.len(), title);
        Ok(added)
    }

    fn next_free_copy_id(&self) -> CopyId {
        loop {
            let n = self.next_copy_number.fetch_add(1, Ordering::SeqCst);
            let id = CopyId::new(n.to_string());
            if !self.rows.contains_key(&id) {
                return id;
            }
        }
    }

    /// Validates and logs a new copy. The caller holds the catalog lock.
    fn insert_copy(&self, new_copy: NewCopy) -> Result<BookCopy, StoreError> {
        let NewCopy {
            id,
            title,
            author,
            category,
        } = new_copy;

        let id = CopyId::new(id.as_str().trim());
        let title = title.trim().to_string();
        let author = author.trim().to_string();
        let category = match category.trim() {
            "" => NewCopy::DEFAULT_CATEGORY.to_string(),
            c => c.to_string(),
        };

        if id.as_str().is_empty() {
            return Err(StoreError::InvalidInput {
                reason: "copy id must not be empty".to_string(),
            });
        }
        if title.is_empty() || author.is_empty() {
            return Err(StoreError::InvalidInput {
                reason: "title and author are required".to_string(),
            });
        }
        if self.rows.contains_key(&id) {
            return Err(StoreError::CopyExists { copy_id: id });
        }

        let entry = WalEntry::AddCopy {
            copy_id: id.as_str().to_string(),
            title: title.clone(),
            author: author.clone(),
            category: category.clone(),
        };
        let (sequence, _offset) = self.wal.append(&entry)?;

        let copy = BookCopy {
            id,
            title,
            author,
            category,
            availability: Availability::Available,
        };
        self.insert_row(copy.clone());

        tracing::debug!("Added copy {} (seq {})", copy.id, sequence);
        Ok(copy)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_copy(&self, copy_id: &CopyId) -> Result<BookCopy, StoreError> {
        self.with_row(copy_id, |row| row.copy.clone())
    }

    /// Returns the copy and its open loan as one consistent observation.
    pub fn copy_status(&self, copy_id: &CopyId) -> Result<CopyStatus, StoreError> {
        self.with_row(copy_id, |row| CopyStatus {
            copy: row.copy.clone(),
            open_loan: row.open_loan.clone(),
        })
    }

    /// Lists every copy, generated numeric ids first in numeric order.
    pub fn list_copies(&self) -> Vec<BookCopy> {
        let mut copies: Vec<BookCopy> = self
            .all_rows()
            .iter()
            .map(|row| row.lock().copy.clone())
            .collect();
        copies.sort_by(|a, b| {
            let key = |c: &BookCopy| (c.id.number().is_none(), c.id.number());
            key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
        });
        copies
    }

    /// All loans of one copy, oldest first. The open loan, if any, comes last.
    pub fn loan_history(&self, copy_id: &CopyId) -> Result<Vec<Loan>, StoreError> {
        self.with_row(copy_id, |row| row.loans().cloned().collect())
    }

    pub fn open_loans(&self) -> Vec<Loan> {
        let mut loans: Vec<Loan> = self
            .all_rows()
            .iter()
            .filter_map(|row| row.lock().open_loan.clone())
            .collect();
        loans.sort_by_key(|l| l.id);
        loans
    }

    pub fn all_loans(&self) -> Vec<Loan> {
        let mut loans: Vec<Loan> = self
            .all_rows()
            .iter()
            .flat_map(|row| row.lock().loans().cloned().collect::<Vec<_>>())
            .collect();
        loans.sort_by_key(|l| l.id);
        loans
    }

    pub fn get_loan(&self, loan_id: LoanId) -> Result<Loan, StoreError> {
        let copy_id = self
            .loan_index
            .get(&loan_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::LoanNotFound { loan_id })?;
        self.with_row(&copy_id, |row| {
            row.loans().find(|l| l.id == loan_id).cloned()
        })?
        .ok_or(StoreError::LoanNotFound { loan_id })
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            next_sequence: self.wal.next_sequence(),
            wal: self.wal.stats(),
            ..StoreStats::default()
        };

        for row in self.all_rows() {
            let row = row.lock();
            stats.copies += 1;
            if row.copy.availability == Availability::Issued {
                stats.issued += 1;
            }
            if row.open_loan.is_some() {
                stats.open_loans += 1;
            }
            stats.closed_loans += row.history.len();
            let fines = row.history.iter().map(|l| l.fine.cents()).sum::<i64>();
            stats.fines_assessed = Money::from_cents(stats.fines_assessed.cents() + fines);
        }

        stats
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        Ok(self.wal.sync()?)
    }

    /// Flushes and closes the log. Later writes fail.
    pub fn close(&self) -> Result<(), StoreError> {
        Ok(self.wal.close()?)
    }
}

impl CirculationStore for WalStore {
    fn transaction<T, E, F>(&self, copy_id: &CopyId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let row = self.row(copy_id).ok_or_else(|| StoreError::CopyNotFound {
            copy_id: copy_id.clone(),
        })?;
        let mut guard =
            row.try_lock_for(self.options.lock_timeout)
                .ok_or_else(|| StoreError::LockTimeout {
                    copy_id: copy_id.clone(),
                })?;

        let mut txn = WalTxn::new(self, &mut *guard);
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Staged writes against one locked copy row.
pub struct WalTxn<'a> {
    store: &'a WalStore,
    row: &'a mut CopyRow,
    staged_availability: Option<Availability>,
    staged_ledger: Option<LedgerChange>,
    committed: bool,
}

impl<'a> WalTxn<'a> {
    fn new(store: &'a WalStore, row: &'a mut CopyRow) -> Self {
        Self {
            store,
            row,
            staged_availability: None,
            staged_ledger: None,
            committed: false,
        }
    }

    fn check_scope(&self, copy_id: &CopyId) -> Result<(), StoreError> {
        if *copy_id != self.row.copy.id {
            return Err(StoreError::InvalidInput {
                reason: format!(
                    "transaction on copy {} cannot touch copy {}",
                    self.row.copy.id, copy_id
                ),
            });
        }
        Ok(())
    }

    fn stage_ledger(&mut self, change: LedgerChange) -> Result<(), StoreError> {
        if self.staged_ledger.is_some() {
            return Err(StoreError::ConstraintViolation {
                reason: "a transaction carries at most one ledger write".to_string(),
            });
        }
        self.staged_ledger = Some(change);
        Ok(())
    }

    fn has_staged_writes(&self) -> bool {
        self.staged_availability.is_some() || self.staged_ledger.is_some()
    }

    /// Logs the staged writes as one record, then applies them to the row.
    fn commit(&mut self) -> Result<(), StoreError> {
        let (availability, ledger) = match (self.staged_availability, &self.staged_ledger) {
            (None, None) => {
                self.committed = true;
                return Ok(());
            }
            (Some(availability), Some(ledger)) => (availability, ledger.clone()),
            _ => {
                return Err(StoreError::ConstraintViolation {
                    reason: format!(
                        "availability and loan of copy {} must change together",
                        self.row.copy.id
                    ),
                })
            }
        };

        self.row
            .validate(availability, &ledger)
            .map_err(|reason| StoreError::ConstraintViolation { reason })?;

        let entry = WalEntry::Transition {
            copy_id: self.row.copy.id.as_str().to_string(),
            availability: availability.as_str().to_string(),
            ledger: ledger.clone(),
        };
        let (sequence, _offset) = self.store.wal.append(&entry)?;

        let loan_id = LoanId::new(ledger.loan_id());
        self.store
            .loan_index
            .insert(loan_id, self.row.copy.id.clone());
        self.row.apply(availability, ledger);
        self.committed = true;

        tracing::debug!(
            "Committed loan {} on copy {} -> {} (seq {})",
            loan_id,
            self.row.copy.id,
            availability,
            sequence
        );
        Ok(())
    }
}

impl CatalogStore for WalTxn<'_> {
    fn get_availability(&self, copy_id: &CopyId) -> Result<Availability, StoreError> {
        self.check_scope(copy_id)?;
        Ok(self
            .staged_availability
            .unwrap_or(self.row.copy.availability))
    }

    fn set_availability(
        &mut self,
        copy_id: &CopyId,
        availability: Availability,
    ) -> Result<(), StoreError> {
        self.check_scope(copy_id)?;
        self.staged_availability = Some(availability);
        Ok(())
    }
}

impl LedgerStore for WalTxn<'_> {
    fn create_loan(
        &mut self,
        copy_id: &CopyId,
        member_id: &MemberId,
        issue_date: NaiveDate,
        due_date: NaiveDate,
    ) -> Result<LoanId, StoreError> {
        self.check_scope(copy_id)?;
        if member_id.as_str().trim().is_empty() {
            return Err(StoreError::InvalidInput {
                reason: "member id must not be empty".to_string(),
            });
        }

        let loan_id = self.store.next_loan_id.fetch_add(1, Ordering::SeqCst);
        self.stage_ledger(LedgerChange::OpenLoan {
            loan_id,
            member_id: member_id.as_str().to_string(),
            issue_date,
            due_date,
        })?;
        Ok(LoanId::new(loan_id))
    }

    fn find_open_loan(&self, copy_id: &CopyId) -> Result<Option<Loan>, StoreError> {
        self.check_scope(copy_id)?;
        let loan = match &self.staged_ledger {
            Some(LedgerChange::OpenLoan {
                loan_id,
                member_id,
                issue_date,
                due_date,
            }) => Some(Loan {
                id: LoanId::new(*loan_id),
                copy_id: copy_id.clone(),
                member_id: MemberId::new(member_id.clone()),
                issue_date: *issue_date,
                due_date: *due_date,
                return_date: None,
                fine: Money::ZERO,
            }),
            Some(LedgerChange::CloseLoan { .. }) => None,
            None => self.row.open_loan.clone(),
        };
        Ok(loan)
    }

    fn close_loan(
        &mut self,
        loan_id: LoanId,
        return_date: NaiveDate,
        fine: Money,
    ) -> Result<(), StoreError> {
        match &self.row.open_loan {
            Some(open) if open.id == loan_id => {}
            _ => return Err(StoreError::LoanNotFound { loan_id }),
        }
        if fine.is_negative() {
            return Err(StoreError::InvalidInput {
                reason: format!("fine for loan {} must not be negative", loan_id),
            });
        }

        self.stage_ledger(LedgerChange::CloseLoan {
            loan_id: loan_id.get(),
            return_date,
            fine_cents: fine.cents(),
        })
    }
}

impl Drop for WalTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && self.has_staged_writes() {
            tracing::debug!(
                "Rolled back uncommitted writes on copy {}",
                self.row.copy.id
            );
        }
    }
}
