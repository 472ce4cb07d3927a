use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::{
    now_utc, HistoryFilter, JournalEntry, LedgerCheck, LedgerError, Lot, LotId, LotState,
    NewJournalEntry, NewLot, UserId,
};

/// Transactional storage for lots, balances and the journal.
///
/// Mutations only happen through a [`LedgerUnit`] obtained from
/// [`LedgerStore::lock_user`], which holds an exclusive lock on one user's
/// ledger until it is committed or dropped.
pub trait LedgerStore {
    type Unit<'a>: LedgerUnit
    where
        Self: 'a;

    /// Opens an atomic unit scoped to `user_id`, waiting at most `timeout`
    /// for a competing unit on the same user to finish.
    ///
    /// # Errors
    /// Returns [`LedgerError::Busy`] when the wait exceeds `timeout` and
    /// [`LedgerError::Storage`] for backend failures.
    fn lock_user(
        &mut self,
        user_id: UserId,
        timeout: std::time::Duration,
    ) -> Result<Self::Unit<'_>, LedgerError>;

    /// Committed balance; `0` for users without any ledger activity.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn balance(&self, user_id: UserId) -> Result<i64, LedgerError>;

    /// All lots of a user ordered by `valid_until`, then lot id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn lots(&self, user_id: UserId) -> Result<Vec<Lot>, LedgerError>;

    /// Journal entries ordered by sequence, filtered by `filter`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn history(
        &self,
        user_id: UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<JournalEntry>, LedgerError>;

    /// Users owning at least one lot that is due at `now`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn users_with_due_lots(&self, now: OffsetDateTime) -> Result<Vec<UserId>, LedgerError>;

    /// Audits every user's balance against their lots from one consistent
    /// read.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn check(&self, now: OffsetDateTime) -> Result<LedgerCheck, LedgerError>;
}

/// One user's atomic unit of work. Dropping a unit without calling
/// [`LedgerUnit::commit`] discards every change made through it.
pub trait LedgerUnit: Sized {
    fn user_id(&self) -> UserId;

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn balance(&self) -> Result<i64, LedgerError>;

    /// Earn entry previously recorded for this user under `external_reference`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn find_earn(&self, external_reference: &str) -> Result<Option<JournalEntry>, LedgerError>;

    /// Active lots with points left and `valid_until > now`, soonest expiry first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn redeemable_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError>;

    /// Active lots with points left and `valid_until < now`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn due_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn insert_lot(&mut self, lot: &NewLot) -> Result<Lot, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the lot does not belong to this
    /// unit's user or the backend fails.
    fn update_lot(
        &mut self,
        lot_id: LotId,
        remaining_amount: i64,
        state: LotState,
    ) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn set_balance(&mut self, balance: i64) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Busy`] or [`LedgerError::Storage`] when the
    /// backend cannot make the unit durable; nothing is applied in that case.
    fn commit(self) -> Result<(), LedgerError>;
}

/// Source of "now" for the engine.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Manually driven clock; clones share the same instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cooperative cancellation flag checked by the engine right before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
