//! The reconciliation queue: a persistent record of payments and callbacks
//! that could not be settled automatically.
//!
//! The callback endpoint acknowledges every delivery, so anything that goes
//! wrong after the acknowledgement must end up here instead of being lost.
//! Retryable items are replayed by the status poller, the rest wait for an
//! operator.

use std::{fmt::Display, str::FromStr};

use rusqlite::{
    Connection, Row,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{Error, database_id::ReconciliationItemId};

/// Why an item was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// A success-coded callback was missing its amount or receipt number.
    MalformedCallback,
    /// Money arrived from a phone number that no user owns.
    UnassociatedFunds,
    /// A payment could not be recorded because its category total could not
    /// be recomputed.
    PendingAggregate,
    /// A callback or payment could not be processed, e.g. the callback queue
    /// was full or the database was unavailable.
    ProcessingFailed,
    /// The provider never reported a result for a payment request.
    TimedOut,
}

impl ReconciliationKind {
    /// The name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationKind::MalformedCallback => "malformed_callback",
            ReconciliationKind::UnassociatedFunds => "unassociated_funds",
            ReconciliationKind::PendingAggregate => "pending_aggregate",
            ReconciliationKind::ProcessingFailed => "processing_failed",
            ReconciliationKind::TimedOut => "timed_out",
        }
    }

    /// Whether items of this kind can be settled by replaying their payload.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconciliationKind::PendingAggregate | ReconciliationKind::ProcessingFailed
        )
    }
}

impl Display for ReconciliationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconciliationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed_callback" => Ok(ReconciliationKind::MalformedCallback),
            "unassociated_funds" => Ok(ReconciliationKind::UnassociatedFunds),
            "pending_aggregate" => Ok(ReconciliationKind::PendingAggregate),
            "processing_failed" => Ok(ReconciliationKind::ProcessingFailed),
            "timed_out" => Ok(ReconciliationKind::TimedOut),
            other => Err(format!("unknown reconciliation kind \"{other}\"")),
        }
    }
}

impl ToSql for ReconciliationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ReconciliationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: String| FromSqlError::Other(error.into()))
    }
}

/// An item in the reconciliation queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationItem {
    /// The ID of the item.
    pub id: ReconciliationItemId,
    /// Why the item was queued.
    pub kind: ReconciliationKind,
    /// The payment request the item relates to, if known.
    pub checkout_request_id: Option<String>,
    /// The provider receipt the item relates to, if known.
    pub receipt_number: Option<String>,
    /// The raw callback or serialized payment needed to settle the item.
    pub payload: Option<String>,
    /// A human readable explanation.
    pub reason: String,
    /// How many times the item has been replayed.
    pub attempts: u32,
    /// Whether the item has been settled.
    pub resolved: bool,
    /// When the item was queued.
    pub created_at: OffsetDateTime,
    /// When the item was last changed.
    pub updated_at: OffsetDateTime,
}

/// The data needed to queue a new item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewReconciliationItem<'a> {
    /// The payment request the item relates to, if known.
    pub checkout_request_id: Option<&'a str>,
    /// The provider receipt the item relates to, if known.
    pub receipt_number: Option<&'a str>,
    /// The raw callback or serialized payment needed to settle the item.
    pub payload: Option<&'a str>,
    /// A human readable explanation.
    pub reason: &'a str,
}

const ITEM_COLUMNS: &str = "id, kind, checkout_request_id, receipt_number, payload, reason, \
     attempts, resolved, created_at, updated_at";

/// Add an item to the queue.
///
/// This logs the item, so callers do not log the problem again.
///
/// Call this with the same connection (or transaction) as the write that
/// caused the item so both are committed or rolled back together.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn enqueue(
    kind: ReconciliationKind,
    item: NewReconciliationItem,
    connection: &Connection,
) -> Result<ReconciliationItem, Error> {
    let now = OffsetDateTime::now_utc();

    let item = connection
        .prepare(&format!(
            "INSERT INTO reconciliation_item
                (kind, checkout_request_id, receipt_number, payload, reason, attempts, resolved, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
             RETURNING {ITEM_COLUMNS}"
        ))?
        .query_row(
            (
                kind,
                item.checkout_request_id,
                item.receipt_number,
                item.payload,
                item.reason,
                now,
            ),
            map_row,
        )?;

    tracing::warn!(
        item_id = item.id,
        kind = %kind,
        checkout_request_id = item.checkout_request_id.as_deref(),
        receipt_number = item.receipt_number.as_deref(),
        "Queued item for reconciliation: {}",
        item.reason
    );

    Ok(item)
}

/// Retrieve an item by its `id`.
///
/// # Errors
/// Returns [Error::NotFound] if there is no item with `id`.
pub fn get_item(
    id: ReconciliationItemId,
    connection: &Connection,
) -> Result<ReconciliationItem, Error> {
    connection
        .prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM reconciliation_item WHERE id = ?1"
        ))?
        .query_row([id], map_row)
        .map_err(|error| error.into())
}

/// Retrieve every unresolved item, oldest first.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn get_unresolved(connection: &Connection) -> Result<Vec<ReconciliationItem>, Error> {
    connection
        .prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM reconciliation_item WHERE resolved = 0 ORDER BY id ASC"
        ))?
        .query_map([], map_row)?
        .map(|maybe_item| maybe_item.map_err(|error| error.into()))
        .collect()
}

/// Retrieve up to `limit` unresolved items of a retryable kind that have been
/// replayed fewer than `max_attempts` times, oldest first.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn get_retryable(
    max_attempts: u32,
    limit: u32,
    connection: &Connection,
) -> Result<Vec<ReconciliationItem>, Error> {
    connection
        .prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM reconciliation_item
             WHERE resolved = 0 AND attempts < ?1 AND kind IN (?2, ?3)
             ORDER BY id ASC
             LIMIT ?4"
        ))?
        .query_map(
            (
                max_attempts,
                ReconciliationKind::PendingAggregate,
                ReconciliationKind::ProcessingFailed,
                limit,
            ),
            map_row,
        )?
        .map(|maybe_item| maybe_item.map_err(|error| error.into()))
        .collect()
}

/// Record a failed replay of an item.
///
/// # Errors
/// Returns [Error::NotFound] if there is no item with `id`.
pub fn record_attempt(
    id: ReconciliationItemId,
    reason: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE reconciliation_item
         SET attempts = attempts + 1, reason = ?1, updated_at = ?2
         WHERE id = ?3",
        (reason, OffsetDateTime::now_utc(), id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Mark an item as settled.
///
/// # Errors
/// Returns [Error::NotFound] if there is no item with `id`.
pub fn resolve_item(id: ReconciliationItemId, connection: &Connection) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE reconciliation_item SET resolved = 1, updated_at = ?1 WHERE id = ?2",
        (OffsetDateTime::now_utc(), id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Mark every unresolved item of `kind` for `receipt_number` as settled.
///
/// Returns the number of items resolved.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn resolve_items_for_receipt(
    kind: ReconciliationKind,
    receipt_number: &str,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "UPDATE reconciliation_item SET resolved = 1, updated_at = ?1
             WHERE kind = ?2 AND receipt_number = ?3 AND resolved = 0",
            (OffsetDateTime::now_utc(), kind, receipt_number),
        )
        .map_err(|error| error.into())
}

/// Mark every unresolved item of `kind` for `checkout_request_id` as settled.
///
/// Returns the number of items resolved.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn resolve_items_for_checkout(
    kind: ReconciliationKind,
    checkout_request_id: &str,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "UPDATE reconciliation_item SET resolved = 1, updated_at = ?1
             WHERE kind = ?2 AND checkout_request_id = ?3 AND resolved = 0",
            (OffsetDateTime::now_utc(), kind, checkout_request_id),
        )
        .map_err(|error| error.into())
}

/// Count the items of `kind`, resolved or not.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn count_items(kind: ReconciliationKind, connection: &Connection) -> Result<u32, Error> {
    connection
        .query_row(
            "SELECT COUNT(id) FROM reconciliation_item WHERE kind = ?1",
            [kind],
            |row| row.get(0),
        )
        .map_err(|error| error.into())
}

/// Create the reconciliation queue table.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_reconciliation_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS reconciliation_item (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                checkout_request_id TEXT,
                receipt_number TEXT,
                payload TEXT,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
                );

        CREATE INDEX IF NOT EXISTS idx_reconciliation_item_open ON reconciliation_item(resolved, kind);",
    )?;

    Ok(())
}

fn map_row(row: &Row) -> Result<ReconciliationItem, rusqlite::Error> {
    Ok(ReconciliationItem {
        id: row.get(0)?,
        kind: row.get(1)?,
        checkout_request_id: row.get(2)?,
        receipt_number: row.get(3)?,
        payload: row.get(4)?,
        reason: row.get(5)?,
        attempts: row.get(6)?,
        resolved: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use crate::{Error, db::initialize};

    use super::{
        NewReconciliationItem, ReconciliationKind, count_items, enqueue, get_item, get_retryable,
        get_unresolved, record_attempt, resolve_item, resolve_items_for_checkout,
    };

    fn get_test_connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        initialize(&connection).unwrap();
        connection
    }

    fn queue(kind: ReconciliationKind, connection: &Connection) -> i64 {
        enqueue(
            kind,
            NewReconciliationItem {
                checkout_request_id: Some("ws_CO_1"),
                payload: Some("{}"),
                reason: "test",
                ..Default::default()
            },
            connection,
        )
        .unwrap()
        .id
    }

    #[test]
    fn enqueue_stores_item() {
        let connection = get_test_connection();

        let item = enqueue(
            ReconciliationKind::MalformedCallback,
            NewReconciliationItem {
                checkout_request_id: Some("ws_CO_1"),
                receipt_number: None,
                payload: Some("{\"Body\":{}}"),
                reason: "missing receipt number",
            },
            &connection,
        )
        .unwrap();

        assert_eq!(item.kind, ReconciliationKind::MalformedCallback);
        assert_eq!(item.checkout_request_id.as_deref(), Some("ws_CO_1"));
        assert_eq!(item.attempts, 0);
        assert!(!item.resolved);
        assert_eq!(get_item(item.id, &connection), Ok(item));
    }

    #[test]
    fn only_retryable_kinds_are_replayed() {
        let connection = get_test_connection();
        queue(ReconciliationKind::MalformedCallback, &connection);
        queue(ReconciliationKind::UnassociatedFunds, &connection);
        queue(ReconciliationKind::TimedOut, &connection);
        let pending = queue(ReconciliationKind::PendingAggregate, &connection);
        let failed = queue(ReconciliationKind::ProcessingFailed, &connection);

        let ids: Vec<i64> = get_retryable(5, 10, &connection)
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();

        assert_eq!(ids, vec![pending, failed]);
    }

    #[test]
    fn exhausted_items_are_not_replayed() {
        let connection = get_test_connection();
        let id = queue(ReconciliationKind::PendingAggregate, &connection);

        record_attempt(id, "still failing", &connection).unwrap();
        record_attempt(id, "still failing", &connection).unwrap();

        assert!(get_retryable(2, 10, &connection).unwrap().is_empty());
        assert_eq!(get_item(id, &connection).unwrap().attempts, 2);
    }

    #[test]
    fn resolved_items_leave_the_queue() {
        let connection = get_test_connection();
        let id = queue(ReconciliationKind::ProcessingFailed, &connection);

        resolve_item(id, &connection).unwrap();

        assert!(get_unresolved(&connection).unwrap().is_empty());
        assert!(get_retryable(5, 10, &connection).unwrap().is_empty());
        assert_eq!(count_items(ReconciliationKind::ProcessingFailed, &connection), Ok(1));
    }

    #[test]
    fn resolving_missing_item_returns_not_found() {
        let connection = get_test_connection();

        assert_eq!(resolve_item(7, &connection), Err(Error::NotFound));
    }

    #[test]
    fn kind_round_trips_through_its_name() {
        for kind in [
            ReconciliationKind::MalformedCallback,
            ReconciliationKind::UnassociatedFunds,
            ReconciliationKind::PendingAggregate,
            ReconciliationKind::ProcessingFailed,
            ReconciliationKind::TimedOut,
        ] {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
    }

    #[test]
    fn resolves_items_by_checkout_request() {
        let connection = get_test_connection();
        let timed_out = queue(ReconciliationKind::TimedOut, &connection);
        let malformed = queue(ReconciliationKind::MalformedCallback, &connection);

        let resolved =
            resolve_items_for_checkout(ReconciliationKind::TimedOut, "ws_CO_1", &connection);

        assert_eq!(resolved, Ok(1));
        assert!(get_item(timed_out, &connection).unwrap().resolved);
        assert!(!get_item(malformed, &connection).unwrap().resolved);
    }
}
