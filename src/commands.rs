//! Command execution.

use crate::config::{Config, ConfigError};
use crate::LedgerCommand;
use colored::Colorize;
use shelfdb_core::{
    Availability, BookCopy, CirculationEngine, CirculationError, CopyId, Loan, MemberId, NewCopy,
    StoreError, WalStore,
};
use shelfdb_wal::{RecoveryResult, WalError};
use thiserror::Error;

/// Errors surfaced by the command line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Circulation(#[from] CirculationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CommandError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CommandError::Circulation(e) => e.error_code(),
            CommandError::Store(e) => e.error_code(),
            CommandError::Wal(e) => e.error_code(),
            CommandError::Config(_) => "CONFIG",
        }
    }
}

/// Executes a command, then flushes and closes the log.
///
/// A command whose writes cannot be synced fails, even if it otherwise
/// succeeded.
pub fn execute_and_close(
    engine: &CirculationEngine<WalStore>,
    cmd: LedgerCommand,
) -> Result<String, CommandError> {
    finish(execute(engine, cmd), engine.store().close())
}

fn finish(
    output: Result<String, CommandError>,
    closed: Result<(), StoreError>,
) -> Result<String, CommandError> {
    match (output, closed) {
        (output, Ok(())) => output,
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Err(close_err)) => {
            tracing::error!("Failed to sync WAL on exit: {}", close_err);
            Err(e)
        }
    }
}

/// Executes a command and returns the formatted output.
pub fn execute(
    engine: &CirculationEngine<WalStore>,
    cmd: LedgerCommand,
) -> Result<String, CommandError> {
    let store = engine.store();

    match cmd {
        LedgerCommand::Issue { copy, member } => {
            let receipt = engine.issue_book(&CopyId::new(copy), &MemberId::new(member))?;
            Ok(format!(
                "{} copy {} to member {}\n  Loan: {}\n  Issued: {}\n  Due: {}",
                "Issued".green(),
                receipt.copy_id.to_string().cyan(),
                receipt.member_id,
                receipt.loan_id,
                receipt.issue_date,
                receipt.due_date.to_string().yellow()
            ))
        }

        LedgerCommand::Return { copy } => {
            let receipt = engine.return_book(&CopyId::new(copy))?;
            let mut output = format!(
                "{} copy {} from member {}\n  Loan: {}\n  Due: {}\n  Returned: {}\n  Fine: {}",
                "Returned".green(),
                receipt.copy_id.to_string().cyan(),
                receipt.member_id,
                receipt.loan_id,
                receipt.due_date,
                receipt.return_date,
                receipt.fine
            );
            if receipt.has_penalty() {
                output.push_str(&format!(
                    "\n{}",
                    format!(
                        "Penalty: {} days overdue, fine of {} due",
                        receipt.days_overdue, receipt.fine
                    )
                    .yellow()
                    .bold()
                ));
            }
            Ok(output)
        }

        LedgerCommand::AddCopy {
            id,
            title,
            author,
            category,
        } => {
            let mut new_copy = NewCopy::new(id, title, author);
            if let Some(category) = category {
                new_copy = new_copy.with_category(category);
            }
            let copy = store.add_copy(new_copy)?;
            Ok(format!("{} {}", "Added".green(), format_copy(&copy)))
        }

        LedgerCommand::AddCopies {
            title,
            author,
            category,
            quantity,
        } => {
            let copies = store.add_copies(&title, &author, category.as_deref(), quantity)?;
            let mut output = format!("{} {} copies", "Added".green(), copies.len());
            for copy in &copies {
                output.push_str(&format!("\n  {}", format_copy(copy)));
            }
            Ok(output)
        }

        LedgerCommand::Show { copy } => {
            let status = store.copy_status(&CopyId::new(copy))?;
            let mut output = format!(
                "{}\n  Title: {}\n  Author: {}\n  Category: {}\n  Availability: {}",
                format!("Copy {}", status.copy.id.to_string().cyan()).bold(),
                status.copy.title,
                status.copy.author,
                status.copy.category,
                format_availability(status.copy.availability)
            );
            if let Some(loan) = &status.open_loan {
                output.push_str(&format!(
                    "\n  On loan to {} since {} (loan {}, due {})",
                    loan.member_id, loan.issue_date, loan.id, loan.due_date
                ));
            }
            Ok(output)
        }

        LedgerCommand::List => {
            let copies = store.list_copies();
            if copies.is_empty() {
                return Ok("No copies in the catalog".yellow().to_string());
            }
            Ok(copies
                .iter()
                .map(|c| format!("  {}", format_copy(c)))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        LedgerCommand::Loans { copy, open } => {
            let mut loans = match copy {
                Some(copy) => store.loan_history(&CopyId::new(copy))?,
                None => store.all_loans(),
            };
            if open {
                loans.retain(Loan::is_open);
            }
            if loans.is_empty() {
                return Ok("No loans".yellow().to_string());
            }
            Ok(loans
                .iter()
                .map(|l| format!("  {}", format_loan(l)))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        LedgerCommand::Status => {
            let stats = store.stats();
            let wal = store.wal();
            Ok(format!(
                "{}\n  Copies: {} ({} issued)\n  Open loans: {}\n  Closed loans: {}\n  Fines assessed: {}\n  WAL segments: {}\n  WAL size: {} bytes\n  Next sequence: {}",
                "shelfdb status".bold(),
                stats.copies,
                stats.issued,
                stats.open_loans,
                stats.closed_loans,
                stats.fines_assessed,
                wal.segment_ids().len(),
                wal.total_size(),
                stats.next_sequence
            ))
        }
    }
}

/// Scans (and optionally repairs) the WAL without opening the store.
pub fn verify(config: &Config, repair: bool) -> Result<String, CommandError> {
    let wal_dir = config.storage.wal_dir();
    if !wal_dir.exists() {
        return Ok(format!(
            "{} at {}",
            "No WAL found".yellow(),
            wal_dir.display()
        ));
    }

    let segment_size = config.storage.wal_segment_size();
    let result = if repair {
        shelfdb_wal::repair_wal(&wal_dir, segment_size)?
    } else {
        shelfdb_wal::verify_wal(&wal_dir, segment_size)?
    };

    Ok(format_recovery(&result, repair))
}

fn format_recovery(result: &RecoveryResult, repair: bool) -> String {
    let headline = if result.is_clean() {
        "WAL is clean".green()
    } else if repair {
        "WAL repaired".yellow()
    } else {
        "WAL needs repair".red()
    };

    let mut output = format!(
        "{}\n  Valid records: {}\n  Invalid records: {}\n  Bytes past last valid record: {}\n  Max sequence: {}",
        headline,
        result.valid_records,
        result.invalid_records,
        result.bytes_truncated,
        result.max_sequence
    );
    if !result.segments_recovered.is_empty() {
        output.push_str(&format!(
            "\n  Affected segments: {:?}",
            result.segments_recovered
        ));
    }
    for (segment, error) in &result.segments_with_errors {
        output.push_str(&format!("\n  Segment {}: {}", segment, error.red()));
    }
    output
}

fn format_availability(availability: Availability) -> String {
    match availability {
        Availability::Available => availability.to_string().green().to_string(),
        Availability::Issued => availability.to_string().yellow().to_string(),
    }
}

fn format_copy(copy: &BookCopy) -> String {
    format!(
        "{} {} by {} [{}] {}",
        copy.id.to_string().cyan(),
        copy.title,
        copy.author,
        copy.category,
        format_availability(copy.availability)
    )
}

fn format_loan(loan: &Loan) -> String {
    let returned = match loan.return_date {
        Some(date) => format!("returned {} fine {}", date, loan.fine),
        None => "open".yellow().to_string(),
    };
    format!(
        "loan {} copy {} member {} issued {} due {} {}",
        loan.id,
        loan.copy_id.to_string().cyan(),
        loan.member_id,
        loan.issue_date,
        loan.due_date,
        returned
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shelfdb_core::{FixedClock, StoreOptions};
    use shelfdb_wal::WalConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (CirculationEngine<WalStore>, Arc<FixedClock>) {
        colored::control::set_override(false);
        let store =
            WalStore::open(WalConfig::new(dir.path().join("wal")), StoreOptions::default())
                .unwrap();
        let clock = Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()));
        let engine = CirculationEngine::new(Arc::new(store)).with_clock(clock.clone());
        (engine, clock)
    }

    #[test]
    fn test_issue_and_late_return_output() {
        let dir = TempDir::new().unwrap();
        let (engine, clock) = setup(&dir);

        execute(
            &engine,
            LedgerCommand::AddCopy {
                id: "c1".to_string(),
                title: "Dune".to_string(),
                author: "Frank Herbert".to_string(),
                category: None,
            },
        )
        .unwrap();

        let issued = execute(
            &engine,
            LedgerCommand::Issue {
                copy: "c1".to_string(),
                member: "m42".to_string(),
            },
        )
        .unwrap();
        assert!(issued.contains("Due: 2026-05-16"));

        clock.advance_days(20);
        let returned = execute(
            &engine,
            LedgerCommand::Return {
                copy: "c1".to_string(),
            },
        )
        .unwrap();
        assert!(returned.contains("Fine: 50.00"));
        assert!(returned.contains("Penalty: 5 days overdue"));

        let err = execute(
            &engine,
            LedgerCommand::Return {
                copy: "c1".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "NO_ACTIVE_LOAN");
    }

    #[test]
    fn test_unknown_copy_error_code() {
        let dir = TempDir::new().unwrap();
        let (engine, _clock) = setup(&dir);

        let err = execute(
            &engine,
            LedgerCommand::Issue {
                copy: "unknown".to_string(),
                member: "m1".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err = execute(
            &engine,
            LedgerCommand::Show {
                copy: "unknown".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "COPY_NOT_FOUND");
    }

    #[test]
    fn test_verify_clean_and_missing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();

        let output = verify(&config, false).unwrap();
        assert!(output.contains("No WAL found"));

        let (engine, _clock) = setup(&dir);
        engine
            .store()
            .add_copies("Emma", "Jane Austen", None, 2)
            .unwrap();
        engine.store().close().unwrap();

        let output = verify(&config, false).unwrap();
        assert!(output.contains("WAL is clean"));
        assert!(output.contains("Valid records: 2"));
    }

    #[test]
    fn test_execute_and_close_syncs_and_closes() {
        let dir = TempDir::new().unwrap();
        let (engine, _clock) = setup(&dir);
        engine
            .store()
            .add_copy(NewCopy::new("c1", "Dune", "Frank Herbert"))
            .unwrap();

        let output = execute_and_close(
            &engine,
            LedgerCommand::Issue {
                copy: "c1".to_string(),
                member: "m42".to_string(),
            },
        )
        .unwrap();
        assert!(output.contains("Issued"));

        let err = engine
            .issue_book(&CopyId::new("c1"), &MemberId::new("m1"))
            .unwrap_err();
        assert!(matches!(err, CirculationError::TransactionFailed { .. }));
    }

    #[test]
    fn test_failed_sync_fails_the_command() {
        let sync_failed = || -> Result<(), StoreError> {
            Err(StoreError::Wal(WalError::Io(std::io::Error::other("EIO"))))
        };

        let err = finish(Ok("Issued copy c1".to_string()), sync_failed()).unwrap_err();
        assert_eq!(err.error_code(), "WAL_IO_ERROR");

        // The command's own error wins over the sync error.
        let rejected = CommandError::Circulation(CirculationError::NoActiveLoan {
            copy_id: CopyId::new("c1"),
        });
        let err = finish(Err(rejected), sync_failed()).unwrap_err();
        assert_eq!(err.error_code(), "NO_ACTIVE_LOAN");

        assert_eq!(finish(Ok("ok".to_string()), Ok(())).unwrap(), "ok");
    }
}
