//! Configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SHELFDB_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use shelfdb_core::{LoanPolicy, Money, RetryPolicy, StoreOptions};
use shelfdb_wal::WalConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Loan rules and transaction tuning.
    pub circulation: CirculationConfig,
}

impl Config {
    /// Loads configuration from `path` (if any), then applies environment
    /// variable overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let config = Self::from_file(path)?;
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies overrides looked up by environment variable name.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.storage.apply_overrides(&lookup);
        self.circulation.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.circulation.validate()
    }
}

/// Parses an override value, ignoring (and reporting) values that do not parse.
fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: '{}'", key, raw);
            None
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// WAL segment size in megabytes.
    pub wal_segment_size_mb: u64,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

/// Fsync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Fsync after N milliseconds.
    EveryMs(u32),
    /// Never fsync, rely on OS (fastest, least safe).
    Never,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    /// Accepts `every_write`, `never`, `every_n:<n>` and `every_ms:<ms>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let parse_arg = |arg: &str| {
            arg.parse::<u32>()
                .map_err(|_| format!("invalid fsync policy argument: '{}'", arg))
        };

        match lower.as_str() {
            "every_write" | "everywrite" => Ok(FsyncPolicy::EveryWrite),
            "never" => Ok(FsyncPolicy::Never),
            s => {
                if let Some(n) = s.strip_prefix("every_n:") {
                    parse_arg(n).map(FsyncPolicy::EveryN)
                } else if let Some(ms) = s.strip_prefix("every_ms:") {
                    parse_arg(ms).map(FsyncPolicy::EveryMs)
                } else {
                    Err(format!("unknown fsync policy: '{}'", s))
                }
            }
        }
    }
}

impl From<FsyncPolicy> for shelfdb_wal::FsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => shelfdb_wal::FsyncPolicy::EveryWrite,
            FsyncPolicy::EveryN(n) => shelfdb_wal::FsyncPolicy::EveryN(n),
            FsyncPolicy::EveryMs(ms) => shelfdb_wal::FsyncPolicy::EveryMs(ms),
            FsyncPolicy::Never => shelfdb_wal::FsyncPolicy::Never,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_segment_size_mb: 16,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

impl StorageConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("SHELFDB_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(mb) = parse_override(lookup, "SHELFDB_WAL_SEGMENT_SIZE_MB") {
            self.wal_segment_size_mb = mb;
        }

        if let Some(policy) = parse_override(lookup, "SHELFDB_FSYNC_POLICY") {
            self.fsync_policy = policy;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.wal_segment_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "storage.wal_segment_size_mb must be at least 1".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.data_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the WAL segment size in bytes.
    pub fn wal_segment_size(&self) -> u64 {
        self.wal_segment_size_mb * 1024 * 1024
    }

    /// Returns the WAL directory path.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new(self.wal_dir())
            .with_segment_size(self.wal_segment_size())
            .with_fsync_policy(self.fsync_policy.into())
    }
}

/// Circulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CirculationConfig {
    /// Days from issue until a loan is due.
    pub loan_period_days: u32,
    /// Fine charged per overdue day.
    pub fine_per_day: Money,
    /// How long a transaction waits for a copy's lock.
    pub lock_timeout_ms: u64,
    /// Attempts per operation before giving up on transient failures.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub retry_backoff_ms: u64,
}

impl Default for CirculationConfig {
    fn default() -> Self {
        let policy = LoanPolicy::default();
        let retry = RetryPolicy::default();
        Self {
            loan_period_days: policy.loan_period_days,
            fine_per_day: policy.fine_per_day,
            lock_timeout_ms: StoreOptions::default().lock_timeout.as_millis() as u64,
            max_attempts: retry.max_attempts,
            retry_backoff_ms: retry.initial_backoff.as_millis() as u64,
        }
    }
}

impl CirculationConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(days) = parse_override(lookup, "SHELFDB_LOAN_PERIOD_DAYS") {
            self.loan_period_days = days;
        }

        if let Some(fine) = parse_override(lookup, "SHELFDB_FINE_PER_DAY") {
            self.fine_per_day = fine;
        }

        if let Some(ms) = parse_override(lookup, "SHELFDB_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = ms;
        }

        if let Some(n) = parse_override(lookup, "SHELFDB_MAX_ATTEMPTS") {
            self.max_attempts = n;
        }

        if let Some(ms) = parse_override(lookup, "SHELFDB_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.loan_period_days == 0 {
            return Err(ConfigError::ValidationError(
                "circulation.loan_period_days must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "circulation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.fine_per_day.is_negative() {
            return Err(ConfigError::ValidationError(
                "circulation.fine_per_day must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn loan_policy(&self) -> LoanPolicy {
        LoanPolicy {
            loan_period_days: self.loan_period_days,
            fine_per_day: self.fine_per_day,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default().with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.wal_segment_size(), 16 * 1024 * 1024);
        assert_eq!(config.storage.wal_dir(), PathBuf::from("./data/wal"));
        assert_eq!(config.circulation.loan_period_days, 15);
        assert_eq!(config.circulation.fine_per_day, Money::from_units(10));
        assert_eq!(config.circulation.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "storage:\n  data_dir: /var/lib/shelfdb\n  fsync_policy: never\ncirculation:\n  loan_period_days: 21\n  fine_per_day: \"2.50\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/shelfdb"));
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::Never);
        assert_eq!(config.storage.wal_segment_size_mb, 16);

        let policy = config.circulation.loan_policy();
        assert_eq!(policy.loan_period_days, 21);
        assert_eq!(policy.fine_per_day, Money::from_cents(250));
    }

    #[test]
    fn test_numeric_fine_in_yaml() {
        let config: Config = serde_yaml::from_str("circulation:\n  fine_per_day: 5\n").unwrap();
        assert_eq!(config.circulation.fine_per_day, Money::from_units(5));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/shelfdb.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("SHELFDB_DATA", "/tmp/shelf"),
            ("SHELFDB_FSYNC_POLICY", "every_n:50"),
            ("SHELFDB_LOAN_PERIOD_DAYS", "7"),
            ("SHELFDB_FINE_PER_DAY", "1.5"),
            ("SHELFDB_MAX_ATTEMPTS", "not-a-number"),
        ]));

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/shelf"));
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::EveryN(50));
        assert_eq!(config.circulation.loan_period_days, 7);
        assert_eq!(config.circulation.fine_per_day, Money::from_cents(150));
        assert_eq!(config.circulation.max_attempts, 3);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.circulation.loan_period_days = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.circulation.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fsync_policy_parse() {
        assert_eq!(
            "EVERY_WRITE".parse::<FsyncPolicy>(),
            Ok(FsyncPolicy::EveryWrite)
        );
        assert_eq!(
            "every_ms:200".parse::<FsyncPolicy>(),
            Ok(FsyncPolicy::EveryMs(200))
        );
        assert!("every_n:".parse::<FsyncPolicy>().is_err());
        assert!("sometimes".parse::<FsyncPolicy>().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.circulation.fine_per_day, config.circulation.fine_per_day);
        assert_eq!(parsed.storage.fsync_policy, config.storage.fsync_policy);
    }
}
