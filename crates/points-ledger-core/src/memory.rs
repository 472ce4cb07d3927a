use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::{
    check_user_ledger, HistoryFilter, JournalEntry, JournalKind, LedgerCheck, LedgerError,
    LedgerStore, LedgerUnit, Lot, LotId, LotState, NewJournalEntry, NewLot, UserId,
};

#[derive(Debug, Clone, Default)]
struct UserLedger {
    balance: i64,
    lots: Vec<Lot>,
    journal: Vec<JournalEntry>,
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<UserId, UserLedger>,
    held: BTreeSet<UserId>,
    next_lot_id: LotId,
    next_journal_seq: i64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    released: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("in-memory ledger state is poisoned".to_string()))
    }
}

/// Process-local ledger backend with true per-user locks.
///
/// Clones share the same ledger, so one clone per thread gives concurrent
/// engines over a single store. A unit works on a private copy of its user's
/// ledger and publishes it on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T, LedgerError> {
        let state = self.shared.lock()?;
        Ok(f(&state))
    }
}

fn sorted_lots(lots: &[Lot]) -> Vec<Lot> {
    let mut out = lots.to_vec();
    out.sort_by(|lhs, rhs| {
        lhs.valid_until
            .cmp(&rhs.valid_until)
            .then(lhs.lot_id.cmp(&rhs.lot_id))
    });
    out
}

impl LedgerStore for InMemoryLedgerStore {
    type Unit<'a> = InMemoryUnit<'a>;

    fn lock_user(
        &mut self,
        user_id: UserId,
        timeout: Duration,
    ) -> Result<Self::Unit<'_>, LedgerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock()?;

        while state.held.contains(&user_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LedgerError::Busy(format!(
                    "user {user_id} is locked by another operation (waited {}ms)",
                    timeout.as_millis()
                )));
            }
            let (guard, _) = self
                .shared
                .released
                .wait_timeout(state, deadline - now)
                .map_err(|_| {
                    LedgerError::Storage("in-memory ledger state is poisoned".to_string())
                })?;
            state = guard;
        }

        state.held.insert(user_id);
        let working = state.users.get(&user_id).cloned().unwrap_or_default();
        drop(state);

        Ok(InMemoryUnit {
            shared: &self.shared,
            user_id,
            working,
        })
    }

    fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        self.read(|state| state.users.get(&user_id).map_or(0, |ledger| ledger.balance))
    }

    fn lots(&self, user_id: UserId) -> Result<Vec<Lot>, LedgerError> {
        self.read(|state| {
            state
                .users
                .get(&user_id)
                .map(|ledger| sorted_lots(&ledger.lots))
                .unwrap_or_default()
        })
    }

    fn history(
        &self,
        user_id: UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        filter.validate()?;
        self.read(|state| {
            let Some(ledger) = state.users.get(&user_id) else {
                return Vec::new();
            };
            let matching = ledger.journal.iter().filter(|entry| filter.matches(entry));
            match filter.limit {
                Some(limit) => matching.take(limit).cloned().collect(),
                None => matching.cloned().collect(),
            }
        })
    }

    fn users_with_due_lots(&self, now: OffsetDateTime) -> Result<Vec<UserId>, LedgerError> {
        self.read(|state| {
            state
                .users
                .iter()
                .filter(|(_, ledger)| ledger.lots.iter().any(|lot| lot.is_due_at(now)))
                .map(|(user_id, _)| *user_id)
                .collect()
        })
    }

    fn check(&self, now: OffsetDateTime) -> Result<LedgerCheck, LedgerError> {
        self.read(|state| {
            let issues = state
                .users
                .iter()
                .flat_map(|(user_id, ledger)| {
                    check_user_ledger(*user_id, ledger.balance, &ledger.lots, now)
                })
                .collect();
            LedgerCheck::from_issues(state.users.len(), issues)
        })
    }
}

/// Exclusive unit over one user of an [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryUnit<'a> {
    shared: &'a Shared,
    user_id: UserId,
    working: UserLedger,
}

impl InMemoryUnit<'_> {
    fn lot_mut(&mut self, lot_id: LotId) -> Result<&mut Lot, LedgerError> {
        let user_id = self.user_id;
        self.working
            .lots
            .iter_mut()
            .find(|lot| lot.lot_id == lot_id)
            .ok_or_else(|| LedgerError::Storage(format!("lot {lot_id} not found for user {user_id}")))
    }
}

impl LedgerUnit for InMemoryUnit<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn balance(&self) -> Result<i64, LedgerError> {
        Ok(self.working.balance)
    }

    fn find_earn(&self, external_reference: &str) -> Result<Option<JournalEntry>, LedgerError> {
        Ok(self
            .working
            .journal
            .iter()
            .find(|entry| {
                entry.kind == JournalKind::Earn
                    && entry.external_reference.as_deref() == Some(external_reference)
            })
            .cloned())
    }

    fn redeemable_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
        let mut lots = sorted_lots(&self.working.lots);
        lots.retain(|lot| lot.is_redeemable_at(now));
        Ok(lots)
    }

    fn due_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
        let mut lots = sorted_lots(&self.working.lots);
        lots.retain(|lot| lot.is_due_at(now));
        Ok(lots)
    }

    fn insert_lot(&mut self, lot: &NewLot) -> Result<Lot, LedgerError> {
        if lot.user_id != self.user_id {
            return Err(LedgerError::Storage(format!(
                "unit for user {} cannot insert a lot for user {}",
                self.user_id, lot.user_id
            )));
        }

        let lot_id = {
            let mut state = self.shared.lock()?;
            state.next_lot_id += 1;
            state.next_lot_id
        };

        let stored = Lot {
            lot_id,
            user_id: lot.user_id,
            original_amount: lot.amount,
            remaining_amount: lot.amount,
            earned_at: lot.earned_at,
            valid_until: lot.valid_until,
            state: LotState::Active,
            source_journal_id: lot.source_journal_id,
        };
        stored.validate()?;
        self.working.lots.push(stored.clone());
        Ok(stored)
    }

    fn update_lot(
        &mut self,
        lot_id: LotId,
        remaining_amount: i64,
        state: LotState,
    ) -> Result<(), LedgerError> {
        let lot = self.lot_mut(lot_id)?;
        let mut updated = lot.clone();
        updated.remaining_amount = remaining_amount;
        updated.state = state;
        updated.validate()?;
        *lot = updated;
        Ok(())
    }

    fn set_balance(&mut self, balance: i64) -> Result<(), LedgerError> {
        if balance < 0 {
            return Err(LedgerError::Storage(format!(
                "balance for user {} MUST NOT be negative, got {balance}",
                self.user_id
            )));
        }
        self.working.balance = balance;
        Ok(())
    }

    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, LedgerError> {
        if entry.user_id != self.user_id {
            return Err(LedgerError::Storage(format!(
                "unit for user {} cannot journal for user {}",
                self.user_id, entry.user_id
            )));
        }

        if entry.kind == JournalKind::Earn {
            if let Some(reference) = entry.external_reference.as_deref() {
                if self.find_earn(reference)?.is_some() {
                    return Err(LedgerError::Storage(format!(
                        "duplicate earn reference {reference} for user {}",
                        self.user_id
                    )));
                }
            }
        }

        let journal_seq = {
            let mut state = self.shared.lock()?;
            state.next_journal_seq += 1;
            state.next_journal_seq
        };

        let stored = entry.clone().into_entry(journal_seq);
        self.working.journal.push(stored.clone());
        Ok(stored)
    }

    fn commit(mut self) -> Result<(), LedgerError> {
        let working = std::mem::take(&mut self.working);
        let mut state = self.shared.lock()?;
        state.users.insert(self.user_id, working);
        drop(state);
        Ok(())
    }
}

impl Drop for InMemoryUnit<'_> {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.held.remove(&self.user_id);
        drop(state);
        self.shared.released.notify_all();
    }
}
