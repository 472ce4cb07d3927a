use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{LedgerError, RateTable, Rounding};

pub const DEFAULT_LOT_LIFETIME_DAYS: i64 = 365;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
/// SQLite's busy handler takes the timeout as a signed 32-bit millisecond count.
pub const MAX_LOCK_TIMEOUT_MS: u64 = 2_147_483_647;

const SECONDS_PER_DAY: i64 = 86_400;

/// Converts a day count into a lot lifetime, or `None` when it cannot be
/// represented.
#[must_use]
pub fn lot_lifetime_from_days(days: i64) -> Option<Duration> {
    days.checked_mul(SECONDS_PER_DAY).map(Duration::seconds)
}

/// Engine configuration, injected at construction and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub rates: RateTable,
    pub lot_lifetime: Duration,
    /// Upper bound on waiting for a user's lock before reporting `Busy`.
    pub lock_timeout: std::time::Duration,
    pub rounding: Rounding,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rates: RateTable::default_table(),
            lot_lifetime: Duration::days(DEFAULT_LOT_LIFETIME_DAYS),
            lock_timeout: std::time::Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            rounding: Rounding::Floor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_lot_lifetime_days")]
    lot_lifetime_days: i64,
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,
    #[serde(default)]
    rounding: Rounding,
    #[serde(default)]
    rates: Option<BTreeMap<String, f64>>,
}

fn default_lot_lifetime_days() -> i64 {
    DEFAULT_LOT_LIFETIME_DAYS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

impl LedgerConfig {
    /// Validates lifetime and timeout bounds.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a bound is not positive or
    /// the lock timeout exceeds [`MAX_LOCK_TIMEOUT_MS`].
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.lot_lifetime <= Duration::ZERO {
            return Err(LedgerError::Configuration(
                "lot_lifetime MUST be positive".to_string(),
            ));
        }

        if self.lock_timeout.is_zero() {
            return Err(LedgerError::Configuration(
                "lock_timeout MUST be positive".to_string(),
            ));
        }

        if self.lock_timeout.as_millis() > u128::from(MAX_LOCK_TIMEOUT_MS) {
            return Err(LedgerError::Configuration(format!(
                "lock_timeout MUST be <= {MAX_LOCK_TIMEOUT_MS}ms"
            )));
        }

        Ok(())
    }

    /// Decodes and validates a TOML configuration document. Missing keys
    /// fall back to defaults; a `[rates]` table replaces the default rates.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding fails or decoded
    /// values violate configuration constraints.
    pub fn from_toml_str(raw: &str) -> Result<Self, LedgerError> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|err| LedgerError::Configuration(format!("invalid config TOML: {err}")))?;

        if file.lot_lifetime_days <= 0 {
            return Err(LedgerError::Configuration(
                "lot_lifetime_days MUST be >= 1".to_string(),
            ));
        }

        let lot_lifetime = lot_lifetime_from_days(file.lot_lifetime_days).ok_or_else(|| {
            LedgerError::Configuration(format!(
                "lot_lifetime_days is out of range: {}",
                file.lot_lifetime_days
            ))
        })?;

        let rates = match file.rates {
            Some(entries) => RateTable::from_multipliers(entries)?,
            None => RateTable::default_table(),
        };

        let config = Self {
            rates,
            lot_lifetime,
            lock_timeout: std::time::Duration::from_millis(file.lock_timeout_ms),
            rounding: file.rounding,
        };
        config.validate()?;
        Ok(config)
    }
}
