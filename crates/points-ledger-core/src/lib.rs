//! Expiring reward-points ledger.
//!
//! Purchases create point lots with their own expiry, redemptions drain lots
//! soonest-to-expire first, and a periodic sweep retires overdue lots. The
//! per-user balance is cached alongside the lots and kept equal to the sum of
//! remaining amounts on active lots at every committed state.
//!
//! Storage is abstracted behind [`LedgerStore`]/[`LedgerUnit`]; this crate
//! ships an in-memory backend, and `points-ledger-store-sqlite` provides the
//! durable one. [`LedgerEngine`] implements earn, redeem and expiry on top of
//! either.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod config;
mod engine;
mod error;
mod memory;
mod plan;
mod rates;
mod store;

pub use config::{
    lot_lifetime_from_days, LedgerConfig, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_LOT_LIFETIME_DAYS,
    MAX_LOCK_TIMEOUT_MS,
};
pub use engine::LedgerEngine;
pub use error::{ErrorKind, LedgerError};
pub use memory::{InMemoryLedgerStore, InMemoryUnit};
pub use plan::{
    check_user_ledger, plan_redemption, IssueSeverity, LedgerCheck, LedgerIssue, RedemptionPlan,
};
pub use rates::{compute_points, parse_minor_units, RateTable, Rounding, BASIS_POINTS_PER_UNIT};
pub use store::{CancelToken, Clock, FixedClock, LedgerStore, LedgerUnit, SystemClock};

pub type LotId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotState {
    Active,
    Consumed,
    Expired,
}

impl LotState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "consumed" => Some(Self::Consumed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Earn,
    Redeem,
    Expire,
}

impl JournalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Redeem => "redeem",
            Self::Expire => "expire",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "earn" => Some(Self::Earn),
            "redeem" => Some(Self::Redeem),
            "expire" => Some(Self::Expire),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lot {
    pub lot_id: LotId,
    pub user_id: UserId,
    pub original_amount: i64,
    pub remaining_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub earned_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_until: OffsetDateTime,
    pub state: LotState,
    pub source_journal_id: Ulid,
}

impl Lot {
    /// Active with points left and an expiry strictly after `now`.
    #[must_use]
    pub fn is_redeemable_at(&self, now: OffsetDateTime) -> bool {
        self.state == LotState::Active && self.remaining_amount > 0 && self.valid_until > now
    }

    /// Active with points left and an expiry strictly before `now`.
    #[must_use]
    pub fn is_due_at(&self, now: OffsetDateTime) -> bool {
        self.state == LotState::Active && self.remaining_amount > 0 && self.valid_until < now
    }

    /// Checks the amount bounds and the remaining/state coupling of a lot.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.original_amount <= 0 {
            return Err(LedgerError::Storage(format!(
                "lot {} original_amount MUST be > 0",
                self.lot_id
            )));
        }

        if !(0..=self.original_amount).contains(&self.remaining_amount) {
            return Err(LedgerError::Storage(format!(
                "lot {} remaining_amount MUST be in [0, original_amount]",
                self.lot_id
            )));
        }

        let drained = self.remaining_amount == 0;
        let retired = self.state != LotState::Active;
        if drained != retired {
            return Err(LedgerError::Storage(format!(
                "lot {} is {} with remaining_amount {}",
                self.lot_id,
                self.state.as_str(),
                self.remaining_amount
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLot {
    pub user_id: UserId,
    pub amount: i64,
    pub earned_at: OffsetDateTime,
    pub valid_until: OffsetDateTime,
    pub source_journal_id: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub journal_seq: i64,
    pub journal_id: Ulid,
    pub user_id: UserId,
    pub kind: JournalKind,
    pub amount: i64,
    pub lot_ids: Vec<LotId>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub external_reference: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJournalEntry {
    pub journal_id: Ulid,
    pub user_id: UserId,
    pub kind: JournalKind,
    pub amount: i64,
    pub lot_ids: Vec<LotId>,
    pub occurred_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub external_reference: Option<String>,
    pub details: Value,
}

impl NewJournalEntry {
    #[must_use]
    pub fn into_entry(self, journal_seq: i64) -> JournalEntry {
        JournalEntry {
            journal_seq,
            journal_id: self.journal_id,
            user_id: self.user_id,
            kind: self.kind,
            amount: self.amount,
            lot_ids: self.lot_ids,
            occurred_at: self.occurred_at,
            created_at: self.created_at,
            external_reference: self.external_reference,
            details: self.details,
        }
    }
}

/// Optional filters for [`LedgerStore::history`]; bounds are inclusive and
/// apply to `created_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub from: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub kind: Option<JournalKind>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] when `from` is after `until`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if let (Some(from), Some(until)) = (self.from, self.until) {
            if from > until {
                return Err(LedgerError::InvalidInput(
                    "history range start MUST NOT be after its end".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        self.from.map_or(true, |from| entry.created_at >= from)
            && self.until.map_or(true, |until| entry.created_at <= until)
            && self.kind.map_or(true, |kind| entry.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarnRequest {
    pub user_id: UserId,
    pub external_reference: String,
    /// Purchase amount in minor units (hundredths).
    pub amount_minor: i64,
    pub category: String,
    pub occurred_at: OffsetDateTime,
    /// Falls back to the configured lot lifetime when absent.
    pub lot_lifetime: Option<Duration>,
    pub product_code: Option<String>,
}

impl EarnRequest {
    /// Validates the request shape before any storage access.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidAmount`] for non-positive amounts and
    /// [`LedgerError::InvalidInput`] for blank references, non-UTC
    /// timestamps, or non-positive lifetimes.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount_minor <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "purchase amount MUST be > 0, got {}",
                format_minor_units(self.amount_minor)
            )));
        }

        if self.external_reference.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "external_reference MUST be provided for every earn".to_string(),
            ));
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(LedgerError::InvalidInput(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        if let Some(lifetime) = self.lot_lifetime {
            if lifetime <= Duration::ZERO {
                return Err(LedgerError::InvalidInput(
                    "lot_lifetime MUST be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EarnStatus {
    Credited,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EarnResult {
    pub status: EarnStatus,
    pub user_id: UserId,
    pub points_earned: i64,
    pub balance: i64,
    pub lot_id: Option<LotId>,
    pub journal_id: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotAllocation {
    pub lot_id: LotId,
    pub taken: i64,
    pub remaining_after: i64,
    pub state_after: LotState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedeemResult {
    pub redemption_id: Ulid,
    pub user_id: UserId,
    pub points_redeemed: i64,
    pub balance: i64,
    pub allocations: Vec<LotAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpireFailure {
    pub user_id: UserId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpireSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub users_processed: usize,
    pub lots_expired: usize,
    pub points_expired: i64,
    pub failures: Vec<ExpireFailure>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::InvalidInput`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::InvalidInput(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::InvalidInput(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::InvalidInput`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::InvalidInput(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Fixed-width RFC3339 (nanosecond precision, `Z`), so that text order equals
/// time order in storage.
///
/// # Errors
/// Returns [`LedgerError::InvalidInput`] when the value cannot be rendered
/// with a four-digit year.
pub fn format_sortable_timestamp(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .map_err(|err| LedgerError::InvalidInput(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Renders minor units (hundredths) as a plain decimal string.
#[must_use]
pub fn format_minor_units(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let magnitude = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100)
}
