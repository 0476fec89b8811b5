//! shelfdb - Library circulation ledger
//!
//! Issues and returns copies against a WAL-backed catalog, assessing overdue
//! fines on return.

mod commands;
mod config;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use shelfdb_core::{CirculationEngine, Clock, FixedClock, SystemClock, WalStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shelfdb")]
#[command(about = "Library circulation ledger with WAL durability")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "SHELFDB_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Ledger(LedgerCommand),

    /// Check WAL integrity
    Verify {
        /// Truncate torn or corrupt records
        #[arg(long)]
        repair: bool,
    },
}

/// Commands that run against an open store.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Issue a copy to a member
    Issue {
        /// Copy ID
        copy: String,

        /// Member ID
        member: String,
    },

    /// Return a copy and assess any overdue fine
    Return {
        /// Copy ID
        copy: String,
    },

    /// Add a copy to the catalog
    AddCopy {
        /// Copy ID
        id: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        author: String,

        #[arg(long)]
        category: Option<String>,
    },

    /// Add several copies of a title under generated IDs
    AddCopies {
        #[arg(long)]
        title: String,

        #[arg(long)]
        author: String,

        #[arg(long)]
        category: Option<String>,

        /// Number of copies to add
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
    },

    /// Show a copy and its open loan
    Show {
        /// Copy ID
        copy: String,
    },

    /// List all copies
    List,

    /// List loans
    Loans {
        /// Only loans of this copy
        #[arg(long)]
        copy: Option<String>,

        /// Only open loans
        #[arg(long)]
        open: bool,
    },

    /// Show catalog, ledger and WAL statistics
    Status,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} [{}]: {}", "Error".red(), e.error_code(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<String, commands::CommandError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let command = match cli.command {
        // Verification works on the raw segments, without replaying them.
        Commands::Verify { repair } => return commands::verify(&config, repair),
        Commands::Ledger(command) => command,
    };

    let store = WalStore::open(
        config.storage.wal_config(),
        config.circulation.store_options(),
    )?;

    let clock: Arc<dyn Clock> = match cli.today {
        Some(date) => Arc::new(FixedClock::new(date)),
        None => Arc::new(SystemClock),
    };
    let engine = CirculationEngine::new(Arc::new(store))
        .with_clock(clock)
        .with_policy(config.circulation.loan_policy())
        .with_retry(config.circulation.retry_policy());

    commands::execute_and_close(&engine, command)
}
