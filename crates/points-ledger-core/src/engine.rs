use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::{
    compute_points, format_minor_units, format_rfc3339, plan_redemption, CancelToken, Clock,
    EarnRequest, EarnResult, EarnStatus, ExpireFailure, ExpireSummary, HistoryFilter,
    JournalEntry, JournalKind, LedgerCheck, LedgerConfig, LedgerError, LedgerStore, LedgerUnit,
    Lot, LotState, NewJournalEntry, NewLot, RedeemResult, SystemClock, UserId,
};

/// Earn, redeem and expiry over any [`LedgerStore`].
///
/// Every mutating operation runs inside one [`LedgerUnit`] and either commits
/// completely or leaves storage untouched.
pub struct LedgerEngine<S, C = SystemClock> {
    store: S,
    clock: C,
    config: LedgerConfig,
    cancel: Option<CancelToken>,
}

impl<S: LedgerStore> LedgerEngine<S, SystemClock> {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `config` is invalid.
    pub fn new(store: S, config: LedgerConfig) -> Result<Self, LedgerError> {
        Self::with_clock(store, SystemClock, config)
    }
}

impl<S: LedgerStore, C: Clock> LedgerEngine<S, C> {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `config` is invalid.
    pub fn with_clock(store: S, clock: C, config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
            cancel: None,
        })
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Credits points for a purchase, at most once per `external_reference`.
    ///
    /// # Errors
    /// Returns validation errors before touching storage, [`LedgerError::Busy`]
    /// when the user's lock cannot be taken in time, and
    /// [`LedgerError::Storage`] or [`LedgerError::Cancelled`] after a rollback.
    pub fn earn(&mut self, request: &EarnRequest) -> Result<EarnResult, LedgerError> {
        request.validate()?;
        let rate_bp = self.config.rates.rate_bp(&request.category)?;
        let points = compute_points(request.amount_minor, rate_bp, self.config.rounding)?;
        if points == 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "purchase of {} in {} earns no points",
                format_minor_units(request.amount_minor),
                request.category
            )));
        }

        let lifetime = request.lot_lifetime.unwrap_or(self.config.lot_lifetime);
        let valid_until = request.occurred_at.checked_add(lifetime).ok_or_else(|| {
            LedgerError::InvalidInput("occurred_at + lot_lifetime is out of range".to_string())
        })?;
        let created_at = self.clock.now();

        let mut unit = self
            .store
            .lock_user(request.user_id, self.config.lock_timeout)?;

        if let Some(prior) = unit.find_earn(&request.external_reference)? {
            let balance = unit.balance()?;
            debug!(
                user_id = %request.user_id,
                external_reference = %request.external_reference,
                journal_id = %prior.journal_id,
                "earn already processed"
            );
            return Ok(EarnResult {
                status: EarnStatus::AlreadyProcessed,
                user_id: request.user_id,
                points_earned: prior.amount,
                balance,
                lot_id: prior.lot_ids.first().copied(),
                journal_id: prior.journal_id,
            });
        }

        let journal_id = Ulid::new();
        let lot = unit.insert_lot(&NewLot {
            user_id: request.user_id,
            amount: points,
            earned_at: request.occurred_at,
            valid_until,
            source_journal_id: journal_id,
        })?;

        unit.append_journal(&NewJournalEntry {
            journal_id,
            user_id: request.user_id,
            kind: JournalKind::Earn,
            amount: points,
            lot_ids: vec![lot.lot_id],
            occurred_at: request.occurred_at,
            created_at,
            external_reference: Some(request.external_reference.clone()),
            details: json!({
                "purchase_amount": format_minor_units(request.amount_minor),
                "category": request.category.trim().to_ascii_lowercase(),
                "product_code": request.product_code,
                "rate_bp": rate_bp,
                "rounding": self.config.rounding.as_str(),
            }),
        })?;

        let balance = unit
            .balance()?
            .checked_add(points)
            .ok_or_else(|| LedgerError::Storage("balance overflow".to_string()))?;
        unit.set_balance(balance)?;

        ensure_not_cancelled(self.cancel.as_ref())?;
        unit.commit()?;

        info!(
            user_id = %request.user_id,
            points,
            balance,
            lot_id = lot.lot_id,
            journal_id = %journal_id,
            "earn credited"
        );

        Ok(EarnResult {
            status: EarnStatus::Credited,
            user_id: request.user_id,
            points_earned: points,
            balance,
            lot_id: Some(lot.lot_id),
            journal_id,
        })
    }

    /// Redeems `amount` points, draining the soonest-to-expire lots first.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidAmount`] for non-positive amounts,
    /// [`LedgerError::InsufficientPoints`] when the balance or the redeemable
    /// lots cannot cover `amount` (nothing is changed), and the lock/storage
    /// errors of [`LedgerEngine::earn`].
    pub fn redeem(&mut self, user_id: UserId, amount: i64) -> Result<RedeemResult, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "redeem amount MUST be > 0, got {amount}"
            )));
        }

        let now = self.clock.now();
        let mut unit = self.store.lock_user(user_id, self.config.lock_timeout)?;

        let balance = unit.balance()?;
        if amount > balance {
            return Err(LedgerError::InsufficientPoints {
                requested: amount,
                available: balance,
            });
        }

        let lots = unit.redeemable_lots(now)?;
        let plan = plan_redemption(&lots, amount, now)?;
        debug!(
            user_id = %user_id,
            amount,
            lots_touched = plan.allocations.len(),
            "redemption planned"
        );

        for allocation in &plan.allocations {
            unit.update_lot(
                allocation.lot_id,
                allocation.remaining_after,
                allocation.state_after,
            )?;
        }

        let balance = balance - amount;
        unit.set_balance(balance)?;

        let redemption_id = Ulid::new();
        let allocations = serde_json::to_value(&plan.allocations)
            .map_err(|err| LedgerError::Storage(format!("failed to encode allocations: {err}")))?;
        unit.append_journal(&NewJournalEntry {
            journal_id: redemption_id,
            user_id,
            kind: JournalKind::Redeem,
            amount,
            lot_ids: plan.lot_ids(),
            occurred_at: now,
            created_at: now,
            external_reference: None,
            details: json!({ "allocations": allocations }),
        })?;

        ensure_not_cancelled(self.cancel.as_ref())?;
        unit.commit()?;

        info!(
            user_id = %user_id,
            amount,
            balance,
            redemption_id = %redemption_id,
            "redeem committed"
        );

        Ok(RedeemResult {
            redemption_id,
            user_id,
            points_redeemed: amount,
            balance,
            allocations: plan.allocations,
        })
    }

    /// Retires every lot past its `valid_until` as of `now`, one atomic unit
    /// per user. A failing user is recorded in the summary and skipped.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] only when the set of users with due
    /// lots cannot be read.
    pub fn expire_due(&mut self, now: OffsetDateTime) -> Result<ExpireSummary, LedgerError> {
        let users = self.store.users_with_due_lots(now)?;
        let mut summary = ExpireSummary {
            as_of: now,
            users_processed: 0,
            lots_expired: 0,
            points_expired: 0,
            failures: Vec::new(),
        };

        for user_id in users {
            match self.expire_user(user_id, now) {
                Ok((lots_expired, points_expired)) => {
                    summary.users_processed += 1;
                    summary.lots_expired += lots_expired;
                    summary.points_expired += points_expired;
                }
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "expiry failed for user");
                    let cancelled = matches!(err, LedgerError::Cancelled);
                    summary.failures.push(ExpireFailure {
                        user_id,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    if cancelled {
                        break;
                    }
                }
            }
        }

        info!(
            users_processed = summary.users_processed,
            lots_expired = summary.lots_expired,
            points_expired = summary.points_expired,
            failures = summary.failures.len(),
            "expiry sweep finished"
        );

        Ok(summary)
    }

    fn expire_user(
        &mut self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> Result<(usize, i64), LedgerError> {
        let mut unit = self.store.lock_user(user_id, self.config.lock_timeout)?;
        let due = unit.due_lots(now)?;
        if due.is_empty() {
            return Ok((0, 0));
        }

        let created_at = self.clock.now();
        let mut points_expired = 0_i64;

        for lot in &due {
            unit.update_lot(lot.lot_id, 0, LotState::Expired)?;
            unit.append_journal(&NewJournalEntry {
                journal_id: Ulid::new(),
                user_id,
                kind: JournalKind::Expire,
                amount: lot.remaining_amount,
                lot_ids: vec![lot.lot_id],
                occurred_at: now,
                created_at,
                external_reference: None,
                details: json!({
                    "valid_until": format_rfc3339(lot.valid_until)?,
                    "original_amount": lot.original_amount,
                }),
            })?;
            points_expired += lot.remaining_amount;
        }

        let balance = unit.balance()? - points_expired;
        unit.set_balance(balance)?;

        ensure_not_cancelled(self.cancel.as_ref())?;
        unit.commit()?;

        debug!(
            user_id = %user_id,
            lots_expired = due.len(),
            points_expired,
            balance,
            "user lots expired"
        );

        Ok((due.len(), points_expired))
    }

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    pub fn current_balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        self.store.balance(user_id)
    }

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    pub fn lots(&self, user_id: UserId) -> Result<Vec<Lot>, LedgerError> {
        self.store.lots(user_id)
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] for an inverted range and
    /// [`LedgerError::Storage`] for backend failures.
    pub fn history(
        &self,
        user_id: UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        filter.validate()?;
        self.store.history(user_id, filter)
    }

    /// # Errors
    /// Returns [`LedgerError::Storage`] for backend failures.
    pub fn check(&self) -> Result<LedgerCheck, LedgerError> {
        self.store.check(self.clock.now())
    }
}

fn ensure_not_cancelled(token: Option<&CancelToken>) -> Result<(), LedgerError> {
    if token.is_some_and(CancelToken::is_cancelled) {
        return Err(LedgerError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parse_rfc3339_utc, ErrorKind, FixedClock, InMemoryLedgerStore, InMemoryUnit, LotId,
    };
    use proptest::prelude::*;
    use std::thread;
    use time::Duration;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_clock() -> FixedClock {
        FixedClock::new(must_utc("2026-01-10T00:00:00Z"))
    }

    fn fixture_engine(
        store: InMemoryLedgerStore,
        clock: FixedClock,
    ) -> LedgerEngine<InMemoryLedgerStore, FixedClock> {
        must_ok(LedgerEngine::with_clock(store, clock, LedgerConfig::default()))
    }

    fn earn_request(user: i64, reference: &str, amount_minor: i64, category: &str) -> EarnRequest {
        EarnRequest {
            user_id: UserId(user),
            external_reference: reference.to_string(),
            amount_minor,
            category: category.to_string(),
            occurred_at: must_utc("2026-01-10T00:00:00Z"),
            lot_lifetime: None,
            product_code: None,
        }
    }

    fn earn_with_lifetime(
        engine: &mut LedgerEngine<InMemoryLedgerStore, FixedClock>,
        reference: &str,
        points: i64,
        lifetime_days: i64,
    ) -> EarnResult {
        let mut request = earn_request(1, reference, points * 100, "electronics");
        request.lot_lifetime = Some(Duration::days(lifetime_days));
        must_ok(engine.earn(&request))
    }

    #[test]
    fn earn_redeem_expire_end_to_end() {
        let clock = fixture_clock();
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), clock.clone());

        let earned = must_ok(engine.earn(&earn_request(1, "txn-1", 10_000, "groceries")));
        assert_eq!(earned.status, EarnStatus::Credited);
        assert_eq!(earned.points_earned, 200);
        assert_eq!(earned.balance, 200);

        let redeemed = must_ok(engine.redeem(UserId(1), 150));
        assert_eq!(redeemed.balance, 50);
        assert_eq!(must_ok(engine.current_balance(UserId(1))), 50);

        let after_expiry = must_utc("2027-01-11T00:00:00Z");
        clock.set(after_expiry);
        let summary = must_ok(engine.expire_due(after_expiry));
        assert_eq!(summary.users_processed, 1);
        assert_eq!(summary.lots_expired, 1);
        assert_eq!(summary.points_expired, 50);
        assert!(summary.failures.is_empty());
        assert_eq!(must_ok(engine.current_balance(UserId(1))), 0);

        let kinds: Vec<JournalKind> = must_ok(engine.history(UserId(1), &HistoryFilter::default()))
            .into_iter()
            .map(|entry| entry.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![JournalKind::Earn, JournalKind::Redeem, JournalKind::Expire]
        );
        assert!(must_ok(engine.check()).healthy);
    }

    #[test]
    fn earn_is_idempotent_per_reference() {
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), fixture_clock());

        let first = must_ok(engine.earn(&earn_request(1, "txn-1", 10_000, "groceries")));
        let replay = must_ok(engine.earn(&earn_request(1, "txn-1", 99_900, "electronics")));

        assert_eq!(replay.status, EarnStatus::AlreadyProcessed);
        assert_eq!(replay.points_earned, first.points_earned);
        assert_eq!(replay.journal_id, first.journal_id);
        assert_eq!(replay.lot_id, first.lot_id);
        assert_eq!(replay.balance, 200);
        assert_eq!(must_ok(engine.lots(UserId(1))).len(), 1);

        // same reference for another user is a distinct purchase
        let other = must_ok(engine.earn(&earn_request(2, "txn-1", 10_000, "groceries")));
        assert_eq!(other.status, EarnStatus::Credited);
    }

    #[test]
    fn earn_validation_happens_before_storage() {
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), fixture_clock());

        assert!(matches!(
            engine.earn(&earn_request(1, "txn-1", 10_000, "toys")),
            Err(LedgerError::InvalidCategory(_))
        ));
        assert!(matches!(
            engine.earn(&earn_request(1, "txn-2", -5, "groceries")),
            Err(LedgerError::InvalidAmount(_))
        ));
        // 0.50 * 1.0 truncates to 0 points
        assert!(matches!(
            engine.earn(&earn_request(1, "txn-3", 50, "electronics")),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(must_ok(engine.history(UserId(1), &HistoryFilter::default())).is_empty());
    }

    #[test]
    fn earn_details_record_rate_and_purchase() {
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), fixture_clock());
        let mut request = earn_request(1, "txn-1", 10_099, "Clothing");
        request.product_code = Some("SKU-9".to_string());
        let earned = must_ok(engine.earn(&request));
        assert_eq!(earned.points_earned, 151);

        let history = must_ok(engine.history(UserId(1), &HistoryFilter::default()));
        assert_eq!(history[0].details["purchase_amount"], "100.99");
        assert_eq!(history[0].details["category"], "clothing");
        assert_eq!(history[0].details["product_code"], "SKU-9");
        assert_eq!(history[0].details["rate_bp"], 15_000);

        let lots = must_ok(engine.lots(UserId(1)));
        assert_eq!(lots[0].valid_until, request.occurred_at + Duration::days(365));
        assert_eq!(lots[0].source_journal_id, earned.journal_id);
    }

    #[test]
    fn redeem_drains_soonest_expiring_lot_first() {
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), fixture_clock());
        let later = earn_with_lifetime(&mut engine, "txn-late", 30, 90);
        let sooner = earn_with_lifetime(&mut engine, "txn-soon", 50, 30);

        let redeemed = must_ok(engine.redeem(UserId(1), 60));
        assert_eq!(redeemed.balance, 20);

        let lots = must_ok(engine.lots(UserId(1)));
        let by_id = |lot_id: Option<LotId>| {
            lots.iter()
                .find(|lot| Some(lot.lot_id) == lot_id)
                .map(|lot| (lot.remaining_amount, lot.state))
        };
        assert_eq!(by_id(sooner.lot_id), Some((0, LotState::Consumed)));
        assert_eq!(by_id(later.lot_id), Some((20, LotState::Active)));

        let history = must_ok(engine.history(
            UserId(1),
            &HistoryFilter {
                kind: Some(JournalKind::Redeem),
                ..HistoryFilter::default()
            },
        ));
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].lot_ids,
            vec![must_ok(sooner.lot_id.ok_or("lot")), must_ok(later.lot_id.ok_or("lot"))]
        );
    }

    #[test]
    fn insufficient_points_leaves_ledger_untouched() {
        let clock = fixture_clock();
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), clock.clone());
        earn_with_lifetime(&mut engine, "txn-1", 40, 10);
        earn_with_lifetime(&mut engine, "txn-2", 25, 100);
        let lots_before = must_ok(engine.lots(UserId(1)));

        assert_eq!(
            engine.redeem(UserId(1), 70),
            Err(LedgerError::InsufficientPoints {
                requested: 70,
                available: 65,
            })
        );

        // First lot is overdue but not yet swept: balance covers, lots do not.
        clock.advance(Duration::days(20));
        assert_eq!(
            engine.redeem(UserId(1), 30),
            Err(LedgerError::InsufficientPoints {
                requested: 30,
                available: 25,
            })
        );

        assert_eq!(must_ok(engine.lots(UserId(1))), lots_before);
        assert_eq!(must_ok(engine.current_balance(UserId(1))), 65);
        assert_eq!(
            must_ok(engine.history(UserId(1), &HistoryFilter::default())).len(),
            2
        );
    }

    #[test]
    fn expiry_retires_overdue_lot_and_is_idempotent() {
        let clock = fixture_clock();
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), clock.clone());
        let lot = earn_with_lifetime(&mut engine, "txn-1", 40, 10);
        earn_with_lifetime(&mut engine, "txn-2", 15, 100);

        // Exactly at valid_until nothing is due yet.
        let at_expiry = must_utc("2026-01-20T00:00:00Z");
        assert_eq!(must_ok(engine.expire_due(at_expiry)).lots_expired, 0);

        let now = at_expiry + Duration::SECOND;
        let summary = must_ok(engine.expire_due(now));
        assert_eq!(summary.points_expired, 40);
        assert_eq!(must_ok(engine.current_balance(UserId(1))), 15);

        let expired = must_ok(engine.lots(UserId(1)))
            .into_iter()
            .find(|item| Some(item.lot_id) == lot.lot_id);
        assert!(matches!(
            expired,
            Some(Lot {
                remaining_amount: 0,
                state: LotState::Expired,
                ..
            })
        ));

        let again = must_ok(engine.expire_due(now));
        assert_eq!(again.users_processed, 0);
        assert_eq!(again.points_expired, 0);

        let expire_entries = must_ok(engine.history(
            UserId(1),
            &HistoryFilter {
                kind: Some(JournalKind::Expire),
                ..HistoryFilter::default()
            },
        ));
        assert_eq!(expire_entries.len(), 1);
        assert_eq!(expire_entries[0].amount, 40);
        assert_eq!(expire_entries[0].lot_ids, vec![must_ok(lot.lot_id.ok_or("lot"))]);
    }

    #[test]
    fn locked_user_reports_busy() {
        let mut holder = InMemoryLedgerStore::new();
        let config = LedgerConfig {
            lock_timeout: std::time::Duration::from_millis(20),
            ..LedgerConfig::default()
        };
        let mut engine = must_ok(LedgerEngine::with_clock(
            holder.clone(),
            fixture_clock(),
            config,
        ));
        must_ok(engine.earn(&earn_request(1, "txn-1", 10_000, "groceries")));

        let held = must_ok(holder.lock_user(UserId(1), std::time::Duration::from_millis(20)));
        let err = engine.redeem(UserId(1), 10).err().map(|err| err.kind());
        assert_eq!(err, Some(ErrorKind::Busy));
        drop(held);

        assert_eq!(must_ok(engine.redeem(UserId(1), 10)).balance, 190);
    }

    #[test]
    fn cancelled_token_rolls_back_before_commit() {
        let store = InMemoryLedgerStore::new();
        let token = CancelToken::new();
        let mut engine = fixture_engine(store.clone(), fixture_clock()).with_cancel_token(token.clone());
        must_ok(engine.earn(&earn_request(1, "txn-1", 10_000, "groceries")));

        token.cancel();
        assert_eq!(
            engine.earn(&earn_request(1, "txn-2", 10_000, "groceries")),
            Err(LedgerError::Cancelled)
        );
        assert_eq!(engine.redeem(UserId(1), 50), Err(LedgerError::Cancelled));

        let reader = fixture_engine(store, fixture_clock());
        assert_eq!(must_ok(reader.current_balance(UserId(1))), 200);
        assert_eq!(must_ok(reader.lots(UserId(1))).len(), 1);
    }

    #[test]
    fn expiry_isolates_failing_users() {
        let mut holder = InMemoryLedgerStore::new();
        let clock = fixture_clock();
        let config = LedgerConfig {
            lock_timeout: std::time::Duration::from_millis(20),
            ..LedgerConfig::default()
        };
        let mut engine = must_ok(LedgerEngine::with_clock(holder.clone(), clock, config));
        for user in [1, 2, 3] {
            let mut request = earn_request(user, "txn-1", 1_000, "electronics");
            request.lot_lifetime = Some(Duration::days(1));
            must_ok(engine.earn(&request));
        }

        let held = must_ok(holder.lock_user(UserId(2), std::time::Duration::from_millis(20)));
        let summary = must_ok(engine.expire_due(must_utc("2026-02-01T00:00:00Z")));
        drop(held);

        assert_eq!(summary.users_processed, 2);
        assert_eq!(summary.points_expired, 20);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].user_id, UserId(2));
        assert_eq!(summary.failures[0].kind, ErrorKind::Busy);
        assert_eq!(must_ok(engine.current_balance(UserId(2))), 10);
    }

    #[test]
    fn history_filters_by_kind_range_and_limit() {
        let clock = fixture_clock();
        let mut engine = fixture_engine(InMemoryLedgerStore::new(), clock.clone());
        for index in 0..4 {
            must_ok(engine.earn(&earn_request(1, &format!("txn-{index}"), 1_000, "electronics")));
            clock.advance(Duration::days(1));
        }

        let limited = must_ok(engine.history(
            UserId(1),
            &HistoryFilter {
                limit: Some(2),
                ..HistoryFilter::default()
            },
        ));
        assert_eq!(limited.len(), 2);
        assert!(limited[0].journal_seq < limited[1].journal_seq);

        let ranged = must_ok(engine.history(
            UserId(1),
            &HistoryFilter {
                from: Some(must_utc("2026-01-11T00:00:00Z")),
                until: Some(must_utc("2026-01-12T00:00:00Z")),
                ..HistoryFilter::default()
            },
        ));
        assert_eq!(ranged.len(), 2);

        assert!(engine
            .history(
                UserId(1),
                &HistoryFilter {
                    from: Some(must_utc("2026-02-01T00:00:00Z")),
                    until: Some(must_utc("2026-01-01T00:00:00Z")),
                    ..HistoryFilter::default()
                },
            )
            .is_err());
    }

    #[test]
    fn concurrent_redeems_never_over_redeem() {
        let store = InMemoryLedgerStore::new();
        let clock = fixture_clock();
        let mut seed = fixture_engine(store.clone(), clock.clone());
        must_ok(seed.earn(&earn_request(1, "txn-1", 10_000, "groceries")));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mut engine = fixture_engine(store.clone(), clock.clone());
                thread::spawn(move || engine.redeem(UserId(1), 30).is_ok())
            })
            .collect();
        let successes = workers
            .into_iter()
            .map(|worker| worker.join())
            .filter(|joined| matches!(joined, Ok(true)))
            .count();

        assert_eq!(successes, 6);
        assert_eq!(must_ok(seed.current_balance(UserId(1))), 20);
        assert!(must_ok(seed.check()).healthy);
    }

    struct FailingStore {
        inner: InMemoryLedgerStore,
    }

    struct FailingUnit<'a> {
        inner: InMemoryUnit<'a>,
    }

    impl LedgerStore for FailingStore {
        type Unit<'a> = FailingUnit<'a>;

        fn lock_user(
            &mut self,
            user_id: UserId,
            timeout: std::time::Duration,
        ) -> Result<Self::Unit<'_>, LedgerError> {
            Ok(FailingUnit {
                inner: self.inner.lock_user(user_id, timeout)?,
            })
        }

        fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
            self.inner.balance(user_id)
        }

        fn lots(&self, user_id: UserId) -> Result<Vec<Lot>, LedgerError> {
            self.inner.lots(user_id)
        }

        fn history(
            &self,
            user_id: UserId,
            filter: &HistoryFilter,
        ) -> Result<Vec<JournalEntry>, LedgerError> {
            self.inner.history(user_id, filter)
        }

        fn users_with_due_lots(&self, now: OffsetDateTime) -> Result<Vec<UserId>, LedgerError> {
            self.inner.users_with_due_lots(now)
        }

        fn check(&self, now: OffsetDateTime) -> Result<LedgerCheck, LedgerError> {
            self.inner.check(now)
        }
    }

    impl LedgerUnit for FailingUnit<'_> {
        fn user_id(&self) -> UserId {
            self.inner.user_id()
        }

        fn balance(&self) -> Result<i64, LedgerError> {
            self.inner.balance()
        }

        fn find_earn(&self, external_reference: &str) -> Result<Option<JournalEntry>, LedgerError> {
            self.inner.find_earn(external_reference)
        }

        fn redeemable_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
            self.inner.redeemable_lots(now)
        }

        fn due_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
            self.inner.due_lots(now)
        }

        fn insert_lot(&mut self, lot: &NewLot) -> Result<Lot, LedgerError> {
            self.inner.insert_lot(lot)
        }

        fn update_lot(
            &mut self,
            lot_id: LotId,
            remaining_amount: i64,
            state: LotState,
        ) -> Result<(), LedgerError> {
            self.inner.update_lot(lot_id, remaining_amount, state)
        }

        fn set_balance(&mut self, balance: i64) -> Result<(), LedgerError> {
            self.inner.set_balance(balance)
        }

        fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, LedgerError> {
            if entry.kind == JournalKind::Redeem {
                return Err(LedgerError::Storage("journal write failed".to_string()));
            }
            self.inner.append_journal(entry)
        }

        fn commit(self) -> Result<(), LedgerError> {
            self.inner.commit()
        }
    }

    #[test]
    fn storage_failure_mid_redeem_rolls_back_lot_updates() {
        let store = InMemoryLedgerStore::new();
        let mut engine = must_ok(LedgerEngine::with_clock(
            FailingStore {
                inner: store.clone(),
            },
            fixture_clock(),
            LedgerConfig::default(),
        ));
        must_ok(engine.earn(&earn_request(1, "txn-1", 10_000, "groceries")));
        let lots_before = must_ok(engine.lots(UserId(1)));

        let err = engine.redeem(UserId(1), 50).err().map(|err| err.kind());
        assert_eq!(err, Some(ErrorKind::StorageFailure));
        assert_eq!(must_ok(engine.lots(UserId(1))), lots_before);
        assert_eq!(must_ok(engine.current_balance(UserId(1))), 200);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_balance_matches_active_lots(ops in prop::collection::vec((0u8..4, 1i64..5_000), 1..60)) {
            let clock = fixture_clock();
            let mut engine = fixture_engine(InMemoryLedgerStore::new(), clock.clone());
            let categories = ["electronics", "groceries", "clothing"];

            for (index, (code, value)) in ops.into_iter().enumerate() {
                match code {
                    0 => {
                        let category = categories[usize::try_from(value).unwrap_or(0) % categories.len()];
                        let mut request = earn_request(1, &format!("txn-{index}"), value * 10, category);
                        request.occurred_at = clock.now();
                        request.lot_lifetime = Some(Duration::days(value % 60 + 1));
                        let _ = engine.earn(&request);
                    }
                    1 => {
                        let _ = engine.redeem(UserId(1), value % 400 + 1);
                    }
                    2 => clock.advance(Duration::days(value % 20)),
                    _ => {
                        let _ = engine.expire_due(clock.now());
                    }
                }

                let balance = must_ok(engine.current_balance(UserId(1)));
                let active: i64 = must_ok(engine.lots(UserId(1)))
                    .iter()
                    .filter(|lot| lot.state == LotState::Active)
                    .map(|lot| lot.remaining_amount)
                    .sum();
                prop_assert!(balance >= 0);
                prop_assert_eq!(balance, active);
                prop_assert!(must_ok(engine.check()).healthy);
            }
        }
    }
}
