//! Loan period and overdue fine policy.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A monetary amount in hundredths of a currency unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiplies by a count, saturating at the representable maximum.
    pub fn saturating_mul(self, count: u32) -> Self {
        Self(self.0.saturating_mul(i64::from(count)))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Error returned when parsing a monetary amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount '{input}': {reason}")]
pub struct MoneyParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Money {
    type Err = MoneyParseError;

    /// Parses non-negative amounts such as `10`, `10.5` or `10.00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| MoneyParseError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (whole, frac) = match trimmed.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (trimmed, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err("expected digits before the decimal point"));
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err("at most two decimal digits are allowed"));
        }

        let units: i64 = whole.parse().map_err(|_| err("amount is too large"))?;
        let cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| err("invalid fraction"))? * 10,
            _ => frac.parse::<i64>().map_err(|_| err("invalid fraction"))?,
        };

        units
            .checked_mul(100)
            .and_then(|c| c.checked_add(cents))
            .map(Money)
            .ok_or_else(|| err("amount is too large"))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Units(u32),
            Decimal(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Units(units) => Ok(Money::from_units(i64::from(units))),
            Repr::Decimal(value) if value.is_finite() && value >= 0.0 => {
                Ok(Money((value * 100.0).round() as i64))
            }
            Repr::Decimal(value) => Err(serde::de::Error::custom(format!(
                "invalid amount: {}",
                value
            ))),
        }
    }
}

/// Whole calendar days between the due date and the return date, clamped at zero.
pub fn days_overdue(due_date: NaiveDate, returned_on: NaiveDate) -> u32 {
    let days = returned_on.signed_duration_since(due_date).num_days();
    u32::try_from(days.max(0)).unwrap_or(u32::MAX)
}

/// How long loans run and what an overdue day costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPolicy {
    pub loan_period_days: u32,
    pub fine_per_day: Money,
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self {
            loan_period_days: 15,
            fine_per_day: Money::from_units(10),
        }
    }
}

impl LoanPolicy {
    pub fn due_date(&self, issue_date: NaiveDate) -> NaiveDate {
        issue_date
            .checked_add_days(Days::new(u64::from(self.loan_period_days)))
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn fine_for(&self, days_overdue: u32) -> Money {
        self.fine_per_day.saturating_mul(days_overdue)
    }

    /// Days overdue and the resulting fine for a return on `returned_on`.
    pub fn assess(&self, due_date: NaiveDate, returned_on: NaiveDate) -> (u32, Money) {
        let days = days_overdue(due_date, returned_on);
        (days, self.fine_for(days))
    }
}
