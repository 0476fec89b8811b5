//! Circulation engine - issues and returns copies as atomic transitions.

use crate::clock::{Clock, SystemClock};
use crate::error::{CirculationError, StoreError};
use crate::fine::{LoanPolicy, Money};
use crate::model::{Availability, CopyId, LoanId, MemberId};
use crate::store::{CatalogStore, CirculationStore, LedgerStore, StoreTxn};
use backon::{BlockingRetryable, ExponentialBuilder};
use chrono::NaiveDate;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

/// Result of issuing a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReceipt {
    pub loan_id: LoanId,
    pub copy_id: CopyId,
    pub member_id: MemberId,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
}

/// Result of returning a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnReceipt {
    pub loan_id: LoanId,
    pub copy_id: CopyId,
    pub member_id: MemberId,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub return_date: NaiveDate,
    pub days_overdue: u32,
    pub fine: Money,
}

impl ReturnReceipt {
    /// Returns true if the member owes a fine for this return.
    pub fn has_penalty(&self) -> bool {
        self.fine.cents() > 0
    }
}

/// How often a transaction is retried after a transient store failure.
///
/// The delay before retry `n` is `initial_backoff * multiplier^(n-1)`, capped
/// at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: initial_backoff.max(Self::default().max_backoff),
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Backoff schedule for the retries after the first attempt.
    fn backoff(&self) -> ExponentialBuilder {
        // backon counts retries, not attempts.
        let max_retries = self.max_attempts.max(1).saturating_sub(1) as usize;
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(max_retries)
    }
}

/// Why one attempt did not commit.
enum AttemptError {
    /// The copy's state rules the operation out. Never retried.
    Rejected(CirculationError),
    Store(StoreError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Store(e) if e.is_retryable())
    }
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        AttemptError::Store(err)
    }
}

/// The circulation engine.
pub struct CirculationEngine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: LoanPolicy,
    retry: RetryPolicy,
}

impl<S: CirculationStore> CirculationEngine<S> {
    /// Creates an engine using the system clock and default policies.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy: LoanPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: LoanPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &LoanPolicy {
        &self.policy
    }

    /// Lends `copy_id` to `member_id` from today until the end of the loan period.
    pub fn issue_book(
        &self,
        copy_id: &CopyId,
        member_id: &MemberId,
    ) -> Result<IssueReceipt, CirculationError> {
        let today = self.clock.today();
        let due_date = self.policy.due_date(today);

        let receipt = self.run(copy_id, "issue", |txn| {
            if txn.get_availability(copy_id)? == Availability::Issued {
                return Err(AttemptError::Rejected(CirculationError::AlreadyIssued {
                    copy_id: copy_id.clone(),
                }));
            }

            let loan_id = txn.create_loan(copy_id, member_id, today, due_date)?;
            txn.set_availability(copy_id, Availability::Issued)?;

            Ok(IssueReceipt {
                loan_id,
                copy_id: copy_id.clone(),
                member_id: member_id.clone(),
                issue_date: today,
                due_date,
            })
        })?;

        tracing::info!(
            "Issued copy {} to member {} (loan {}, due {})",
            receipt.copy_id,
            receipt.member_id,
            receipt.loan_id,
            receipt.due_date
        );
        Ok(receipt)
    }

    /// Closes the open loan on `copy_id` and assesses any overdue fine.
    pub fn return_book(&self, copy_id: &CopyId) -> Result<ReturnReceipt, CirculationError> {
        let today = self.clock.today();

        let receipt = self.run(copy_id, "return", |txn| {
            let loan = txn.find_open_loan(copy_id)?.ok_or_else(|| {
                AttemptError::Rejected(CirculationError::NoActiveLoan {
                    copy_id: copy_id.clone(),
                })
            })?;

            let (days_overdue, fine) = self.policy.assess(loan.due_date, today);
            txn.close_loan(loan.id, today, fine)?;
            txn.set_availability(copy_id, Availability::Available)?;

            Ok(ReturnReceipt {
                loan_id: loan.id,
                copy_id: copy_id.clone(),
                member_id: loan.member_id,
                issue_date: loan.issue_date,
                due_date: loan.due_date,
                return_date: today,
                days_overdue,
                fine,
            })
        })?;

        tracing::info!(
            "Returned copy {} (loan {}, {} days overdue, fine {})",
            receipt.copy_id,
            receipt.loan_id,
            receipt.days_overdue,
            receipt.fine
        );
        Ok(receipt)
    }

    /// Runs one operation as a store transaction, retrying transient failures.
    fn run<T>(
        &self,
        copy_id: &CopyId,
        op: &str,
        mut attempt: impl FnMut(&mut dyn StoreTxn) -> Result<T, AttemptError>,
    ) -> Result<T, CirculationError> {
        let attempts = Cell::new(0u32);

        let result = (|| {
            attempts.set(attempts.get() + 1);
            self.store.transaction(copy_id, &mut attempt)
        })
        .retry(self.retry.backoff())
        .sleep(std::thread::sleep)
        .when(AttemptError::is_retryable)
        .notify(|err: &AttemptError, dur: Duration| {
            if let AttemptError::Store(e) = err {
                tracing::warn!(
                    "Retrying {} on copy {} in {:?} (attempt {} of {}): {}",
                    op,
                    copy_id,
                    dur,
                    attempts.get(),
                    self.retry.max_attempts,
                    e
                );
            }
        })
        .call();

        match result {
            Ok(value) => Ok(value),
            Err(AttemptError::Rejected(e)) => Err(e),
            Err(AttemptError::Store(StoreError::CopyNotFound { copy_id })) => {
                Err(CirculationError::NotFound { copy_id })
            }
            Err(AttemptError::Store(source)) => {
                tracing::debug!("{} on copy {} failed: {}", op, copy_id, source);
                Err(CirculationError::TransactionFailed {
                    attempts: attempts.get(),
                    source,
                })
            }
        }
    }
}
