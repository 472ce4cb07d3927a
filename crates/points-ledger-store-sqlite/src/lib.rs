#![allow(clippy::missing_errors_doc)]

//! Durable [`LedgerStore`] on SQLite.
//!
//! A [`SqliteUnit`] is a `BEGIN IMMEDIATE` transaction, so it holds the
//! database write lock for its whole lifetime. That excludes every other
//! writer, which is stricter than the per-user exclusion the engine needs.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use points_ledger_core::{
    check_user_ledger, format_sortable_timestamp, now_utc, parse_rfc3339_utc, HistoryFilter,
    JournalEntry, JournalKind, LedgerCheck, LedgerError, LedgerStore, LedgerUnit, Lot, LotId,
    LotState, NewJournalEntry, NewLot, UserId, DEFAULT_LOCK_TIMEOUT_MS, MAX_LOCK_TIMEOUT_MS,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS point_balances (
  user_id INTEGER PRIMARY KEY,
  balance INTEGER NOT NULL CHECK (balance >= 0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS point_journal (
  journal_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  journal_id TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('earn', 'redeem', 'expire')),
  amount INTEGER NOT NULL CHECK (amount > 0),
  lot_ids_json TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  external_reference TEXT,
  details_json TEXT NOT NULL DEFAULT '{}',
  CHECK (kind <> 'earn' OR external_reference IS NOT NULL)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_point_journal_earn_reference
  ON point_journal(user_id, external_reference)
  WHERE kind = 'earn';
CREATE INDEX IF NOT EXISTS idx_point_journal_user_seq
  ON point_journal(user_id, journal_seq);

CREATE TRIGGER IF NOT EXISTS trg_point_journal_no_update
BEFORE UPDATE ON point_journal
BEGIN
  SELECT RAISE(FAIL, 'point_journal is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_point_journal_no_delete
BEFORE DELETE ON point_journal
BEGIN
  SELECT RAISE(FAIL, 'point_journal is append-only');
END;

CREATE TABLE IF NOT EXISTS point_lots (
  lot_id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  original_amount INTEGER NOT NULL CHECK (original_amount > 0),
  remaining_amount INTEGER NOT NULL CHECK (
    remaining_amount >= 0 AND remaining_amount <= original_amount
  ),
  earned_at TEXT NOT NULL,
  valid_until TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('active', 'consumed', 'expired')),
  source_journal_id TEXT NOT NULL,
  CHECK ((state = 'active') = (remaining_amount > 0)),
  FOREIGN KEY (source_journal_id) REFERENCES point_journal(journal_id)
    DEFERRABLE INITIALLY DEFERRED
);

CREATE INDEX IF NOT EXISTS idx_point_lots_user_expiry
  ON point_lots(user_id, state, valid_until, lot_id);
CREATE INDEX IF NOT EXISTS idx_point_lots_due
  ON point_lots(state, valid_until);

CREATE TRIGGER IF NOT EXISTS trg_point_lots_no_delete
BEFORE DELETE ON point_lots
BEGIN
  SELECT RAISE(FAIL, 'point_lots rows are retired, never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_point_lots_immutable_terms
BEFORE UPDATE OF user_id, original_amount, earned_at, valid_until, source_journal_id
ON point_lots
BEGIN
  SELECT RAISE(FAIL, 'point_lots terms are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_point_lots_no_reactivate
BEFORE UPDATE OF state ON point_lots
WHEN OLD.state <> 'active'
BEGIN
  SELECT RAISE(FAIL, 'retired point_lots cannot change state');
END;
";

const LOT_COLUMNS: &str = "lot_id, user_id, original_amount, remaining_amount, earned_at, \
                           valid_until, state, source_journal_id";

const JOURNAL_COLUMNS: &str = "journal_seq, journal_id, user_id, kind, amount, lot_ids_json, \
                               occurred_at, created_at, external_reference, details_json";

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS))
            .context("failed to configure sqlite busy_timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Convenience for callers that always want an up-to-date schema.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_sortable_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        debug!(
            version = LEDGER_MIGRATION_VERSION,
            newly_applied = inserted == 1,
            "ledger schema migrated"
        );
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema_migrations")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerStore for SqliteLedgerStore {
    type Unit<'a> = SqliteUnit<'a>;

    fn lock_user(
        &mut self,
        user_id: UserId,
        timeout: Duration,
    ) -> Result<Self::Unit<'_>, LedgerError> {
        if timeout.as_millis() > u128::from(MAX_LOCK_TIMEOUT_MS) {
            return Err(LedgerError::Configuration(format!(
                "lock timeout {}ms exceeds {MAX_LOCK_TIMEOUT_MS}ms",
                timeout.as_millis()
            )));
        }
        self.conn.busy_timeout(timeout).map_err(ledger_error)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| match ledger_error(err) {
                LedgerError::Busy(message) => LedgerError::Busy(format!(
                    "user {user_id}: write lock not acquired within {}ms ({message})",
                    timeout.as_millis()
                )),
                other => other,
            })?;

        Ok(SqliteUnit { tx, user_id })
    }

    fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        read_balance(&self.conn, user_id)
    }

    fn lots(&self, user_id: UserId) -> Result<Vec<Lot>, LedgerError> {
        query_lots(
            &self.conn,
            &format!(
                "SELECT {LOT_COLUMNS} FROM point_lots
                 WHERE user_id = ?1
                 ORDER BY valid_until ASC, lot_id ASC"
            ),
            &[SqlValue::Integer(user_id.0)],
        )
    }

    fn history(
        &self,
        user_id: UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        filter.validate()?;

        let mut query = format!("SELECT {JOURNAL_COLUMNS} FROM point_journal WHERE user_id = ?1");
        let mut values = vec![SqlValue::Integer(user_id.0)];

        if let Some(from) = filter.from {
            values.push(SqlValue::Text(format_sortable_timestamp(from)?));
            query.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(SqlValue::Text(format_sortable_timestamp(until)?));
            query.push_str(&format!(" AND created_at <= ?{}", values.len()));
        }
        if let Some(kind) = filter.kind {
            values.push(SqlValue::Text(kind.as_str().to_string()));
            query.push_str(&format!(" AND kind = ?{}", values.len()));
        }

        query.push_str(" ORDER BY journal_seq ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        query_journal(&self.conn, &query, &values)
    }

    fn users_with_due_lots(&self, now: OffsetDateTime) -> Result<Vec<UserId>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT user_id FROM point_lots
                 WHERE state = 'active' AND remaining_amount > 0 AND valid_until < ?1
                 ORDER BY user_id ASC",
            )
            .map_err(ledger_error)?;
        let rows = stmt
            .query_map(params![format_sortable_timestamp(now)?], |row| {
                row.get::<_, i64>(0).map(UserId)
            })
            .map_err(ledger_error)?;
        collect_rows(rows)
    }

    fn check(&self, now: OffsetDateTime) -> Result<LedgerCheck, LedgerError> {
        // One read transaction so balances and lots come from the same snapshot.
        let tx = self.conn.unchecked_transaction().map_err(ledger_error)?;

        let user_ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT user_id FROM point_balances
                     UNION
                     SELECT user_id FROM point_lots
                     ORDER BY user_id ASC",
                )
                .map_err(ledger_error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0).map(UserId))
                .map_err(ledger_error)?;
            collect_rows(rows)?
        };

        let mut issues = Vec::new();
        for user_id in &user_ids {
            let balance = read_balance(&tx, *user_id)?;
            let lots = query_lots(
                &tx,
                &format!("SELECT {LOT_COLUMNS} FROM point_lots WHERE user_id = ?1"),
                &[SqlValue::Integer(user_id.0)],
            )?;
            issues.extend(check_user_ledger(*user_id, balance, &lots, now));
        }

        Ok(LedgerCheck::from_issues(user_ids.len(), issues))
    }
}

/// One user's unit on SQLite: an immediate transaction that rolls back on drop.
pub struct SqliteUnit<'a> {
    tx: rusqlite::Transaction<'a>,
    user_id: UserId,
}

impl SqliteUnit<'_> {
    fn active_lots_where(&self, predicate: &str, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
        query_lots(
            &self.tx,
            &format!(
                "SELECT {LOT_COLUMNS} FROM point_lots
                 WHERE user_id = ?1
                   AND state = 'active'
                   AND remaining_amount > 0
                   AND valid_until {predicate} ?2
                 ORDER BY valid_until ASC, lot_id ASC"
            ),
            &[
                SqlValue::Integer(self.user_id.0),
                SqlValue::Text(format_sortable_timestamp(now)?),
            ],
        )
    }
}

impl LedgerUnit for SqliteUnit<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn balance(&self) -> Result<i64, LedgerError> {
        read_balance(&self.tx, self.user_id)
    }

    fn find_earn(&self, external_reference: &str) -> Result<Option<JournalEntry>, LedgerError> {
        let mut entries = query_journal(
            &self.tx,
            &format!(
                "SELECT {JOURNAL_COLUMNS} FROM point_journal
                 WHERE user_id = ?1 AND kind = 'earn' AND external_reference = ?2
                 LIMIT 1"
            ),
            &[
                SqlValue::Integer(self.user_id.0),
                SqlValue::Text(external_reference.to_string()),
            ],
        )?;
        Ok(entries.pop())
    }

    fn redeemable_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
        self.active_lots_where(">", now)
    }

    fn due_lots(&self, now: OffsetDateTime) -> Result<Vec<Lot>, LedgerError> {
        self.active_lots_where("<", now)
    }

    fn insert_lot(&mut self, lot: &NewLot) -> Result<Lot, LedgerError> {
        if lot.user_id != self.user_id {
            return Err(LedgerError::Storage(format!(
                "unit for user {} cannot insert a lot for user {}",
                self.user_id, lot.user_id
            )));
        }

        self.tx
            .execute(
                "INSERT INTO point_lots(
                    user_id, original_amount, remaining_amount,
                    earned_at, valid_until, state, source_journal_id
                 ) VALUES (?1, ?2, ?2, ?3, ?4, 'active', ?5)",
                params![
                    lot.user_id.0,
                    lot.amount,
                    format_sortable_timestamp(lot.earned_at)?,
                    format_sortable_timestamp(lot.valid_until)?,
                    lot.source_journal_id.to_string(),
                ],
            )
            .map_err(ledger_error)?;

        Ok(Lot {
            lot_id: self.tx.last_insert_rowid(),
            user_id: lot.user_id,
            original_amount: lot.amount,
            remaining_amount: lot.amount,
            earned_at: lot.earned_at,
            valid_until: lot.valid_until,
            state: LotState::Active,
            source_journal_id: lot.source_journal_id,
        })
    }

    fn update_lot(
        &mut self,
        lot_id: LotId,
        remaining_amount: i64,
        state: LotState,
    ) -> Result<(), LedgerError> {
        let updated = self
            .tx
            .execute(
                "UPDATE point_lots SET remaining_amount = ?1, state = ?2
                 WHERE lot_id = ?3 AND user_id = ?4",
                params![remaining_amount, state.as_str(), lot_id, self.user_id.0],
            )
            .map_err(ledger_error)?;

        if updated != 1 {
            return Err(LedgerError::Storage(format!(
                "lot {lot_id} not found for user {}",
                self.user_id
            )));
        }
        Ok(())
    }

    fn set_balance(&mut self, balance: i64) -> Result<(), LedgerError> {
        self.tx
            .execute(
                "INSERT INTO point_balances(user_id, balance, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                   balance = excluded.balance,
                   updated_at = excluded.updated_at",
                params![
                    self.user_id.0,
                    balance,
                    format_sortable_timestamp(now_utc())?
                ],
            )
            .map_err(ledger_error)?;
        Ok(())
    }

    fn append_journal(&mut self, entry: &NewJournalEntry) -> Result<JournalEntry, LedgerError> {
        if entry.user_id != self.user_id {
            return Err(LedgerError::Storage(format!(
                "unit for user {} cannot journal for user {}",
                self.user_id, entry.user_id
            )));
        }

        let lot_ids_json = serde_json::to_string(&entry.lot_ids)
            .map_err(|err| LedgerError::Storage(format!("failed to encode lot_ids: {err}")))?;
        let details_json = serde_json::to_string(&entry.details)
            .map_err(|err| LedgerError::Storage(format!("failed to encode details: {err}")))?;

        self.tx
            .execute(
                "INSERT INTO point_journal(
                    journal_id, user_id, kind, amount, lot_ids_json,
                    occurred_at, created_at, external_reference, details_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.journal_id.to_string(),
                    entry.user_id.0,
                    entry.kind.as_str(),
                    entry.amount,
                    lot_ids_json,
                    format_sortable_timestamp(entry.occurred_at)?,
                    format_sortable_timestamp(entry.created_at)?,
                    entry.external_reference,
                    details_json,
                ],
            )
            .map_err(ledger_error)?;

        Ok(entry.clone().into_entry(self.tx.last_insert_rowid()))
    }

    fn commit(self) -> Result<(), LedgerError> {
        self.tx.commit().map_err(ledger_error)
    }
}

fn ledger_error(err: rusqlite::Error) -> LedgerError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
            LedgerError::Busy(err.to_string())
        }
        _ => LedgerError::Storage(err.to_string()),
    }
}

fn read_balance(conn: &Connection, user_id: UserId) -> Result<i64, LedgerError> {
    let balance = conn
        .query_row(
            "SELECT balance FROM point_balances WHERE user_id = ?1",
            params![user_id.0],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(ledger_error)?;
    Ok(balance.unwrap_or(0))
}

fn query_lots(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<Lot>, LedgerError> {
    let mut stmt = conn.prepare(sql).map_err(ledger_error)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), parse_lot_row)
        .map_err(ledger_error)?;
    collect_rows(rows)
}

fn query_journal(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
) -> Result<Vec<JournalEntry>, LedgerError> {
    let mut stmt = conn.prepare(sql).map_err(ledger_error)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), parse_journal_row)
        .map_err(ledger_error)?;
    collect_rows(rows)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, LedgerError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(ledger_error)?);
    }
    Ok(values)
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_ulid_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid ULID {raw}: {err}")))
}

fn parse_lot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lot> {
    let state_raw: String = row.get(6)?;
    let state = LotState::parse(&state_raw)
        .ok_or_else(|| invalid_column(6, Type::Text, format!("invalid lot state: {state_raw}")))?;

    Ok(Lot {
        lot_id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        original_amount: row.get(2)?,
        remaining_amount: row.get(3)?,
        earned_at: parse_timestamp_column(row, 4)?,
        valid_until: parse_timestamp_column(row, 5)?,
        state,
        source_journal_id: parse_ulid_column(row, 7)?,
    })
}

fn parse_journal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let kind_raw: String = row.get(3)?;
    let kind = JournalKind::parse(&kind_raw)
        .ok_or_else(|| invalid_column(3, Type::Text, format!("invalid journal kind: {kind_raw}")))?;

    let lot_ids_raw: String = row.get(5)?;
    let lot_ids: Vec<LotId> = serde_json::from_str(&lot_ids_raw)
        .map_err(|err| invalid_column(5, Type::Text, format!("invalid lot_ids_json: {err}")))?;

    let details_raw: String = row.get(9)?;
    let details: Value = serde_json::from_str(&details_raw)
        .map_err(|err| invalid_column(9, Type::Text, format!("invalid details_json: {err}")))?;

    Ok(JournalEntry {
        journal_seq: row.get(0)?,
        journal_id: parse_ulid_column(row, 1)?,
        user_id: UserId(row.get(2)?),
        kind,
        amount: row.get(4)?,
        lot_ids,
        occurred_at: parse_timestamp_column(row, 6)?,
        created_at: parse_timestamp_column(row, 7)?,
        external_reference: row.get(8)?,
        details,
    })
}
