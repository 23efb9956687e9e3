//! Defines the ledger entry model and its database queries.

use rusqlite::{
    Connection, Row,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Amount, Error, PhoneNumber, UserID,
    aggregate::Scope,
    database_id::{CategoryId, LedgerEntryId},
};

// ============================================================================
// MODELS
// ============================================================================

/// Marks a receipt number that stands in for one the provider has not sent
/// yet. Provider receipt numbers are alphanumeric, so they never collide.
const PROVISIONAL_RECEIPT_PREFIX: &str = "PENDING:";

/// The receipt number a payment confirmed by a status query is recorded
/// under until its callback delivers the real one.
pub fn provisional_receipt(checkout_request_id: &str) -> String {
    format!("{PROVISIONAL_RECEIPT_PREFIX}{checkout_request_id}")
}

/// Whether `receipt_number` was made by [provisional_receipt].
pub fn is_provisional_receipt(receipt_number: &str) -> bool {
    receipt_number.starts_with(PROVISIONAL_RECEIPT_PREFIX)
}

/// Whether a ledger entry counts towards its owner's totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// The payment went through and counts towards aggregates.
    Completed,
    /// The payment was reversed by the provider and no longer counts.
    Reversed,
}

impl EntryStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Completed => "completed",
            EntryStatus::Reversed => "reversed",
        }
    }
}

impl ToSql for EntryStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "completed" => Ok(EntryStatus::Completed),
            "reversed" => Ok(EntryStatus::Reversed),
            other => Err(FromSqlError::Other(
                format!("unknown ledger entry status \"{other}\"").into(),
            )),
        }
    }
}

/// A completed payment as reported by the provider, normalized and ready to
/// be written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResult {
    /// The provider's unique receipt number, used to deduplicate deliveries.
    pub receipt_number: String,
    /// The amount paid.
    pub amount: Amount,
    /// The payer's phone number, if the provider reported it.
    pub phone_number: Option<PhoneNumber>,
    /// When the provider says the payment happened.
    #[serde(with = "time::serde::rfc3339")]
    pub transaction_date: OffsetDateTime,
    /// The checkout request the payment answers, if known.
    pub checkout_request_id: Option<String>,
}

/// A payment recorded in the ledger.
///
/// Entries are created exactly once per receipt number and are only changed
/// afterwards by explicit corrections (reversal, re-association).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    /// The ID of the entry.
    pub id: LedgerEntryId,
    /// The provider's unique receipt number.
    pub receipt_number: String,
    /// The amount paid.
    pub amount: Amount,
    /// The payer's phone number, if known.
    pub phone_number: Option<PhoneNumber>,
    /// The user the payment belongs to, `None` if no user could be matched.
    pub user_id: Option<UserID>,
    /// The category the payment is aggregated under, if any.
    pub category_id: Option<CategoryId>,
    /// The checkout request the payment answers, if known.
    pub checkout_request_id: Option<String>,
    /// When the provider says the payment happened.
    pub transaction_date: OffsetDateTime,
    /// Whether the entry counts towards aggregates.
    pub status: EntryStatus,
    /// When the entry was written.
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    /// Whether no user could be matched to the payment.
    ///
    /// Unassociated entries are kept for review but excluded from every
    /// user-visible aggregate.
    pub fn is_unassociated(&self) -> bool {
        self.user_id.is_none()
    }

    /// The aggregate scope this entry belongs to, if it has both an owner and
    /// a category.
    pub fn scope(&self) -> Option<Scope> {
        Some(Scope {
            user_id: self.user_id?,
            category_id: self.category_id?,
        })
    }

    /// Whether the provider's receipt number is still unknown.
    pub fn has_provisional_receipt(&self) -> bool {
        is_provisional_receipt(&self.receipt_number)
    }

    /// The amount this entry contributes to its scope's total.
    pub fn contribution(&self) -> Amount {
        match self.status {
            EntryStatus::Completed => self.amount,
            EntryStatus::Reversed => Amount::ZERO,
        }
    }
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

const ENTRY_COLUMNS: &str = "id, receipt_number, amount, phone_number, user_id, category_id, \
     checkout_request_id, transaction_date, status, created_at";

/// Insert a completed entry for `payment` unless its receipt number or
/// checkout request is already in the ledger.
///
/// The check and the insert are a single statement backed by the table's
/// `UNIQUE` constraints, so two concurrent deliveries of the same payment can
/// never both insert.
///
/// Returns `None` if the payment already has an entry.
///
/// # Errors
/// Returns a [Error::SqlError] if there is some other SQL error.
pub fn insert_entry(
    payment: &PaymentResult,
    user_id: Option<UserID>,
    category_id: Option<CategoryId>,
    connection: &Connection,
) -> Result<Option<LedgerEntry>, Error> {
    let mut statement = connection.prepare(&format!(
        "INSERT INTO ledger_entry
            (receipt_number, amount, phone_number, user_id, category_id,
             checkout_request_id, transaction_date, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT DO NOTHING
         RETURNING {ENTRY_COLUMNS}"
    ))?;

    let mut rows = statement.query((
        &payment.receipt_number,
        payment.amount,
        &payment.phone_number,
        user_id.map(|id| id.as_i64()),
        category_id,
        &payment.checkout_request_id,
        payment.transaction_date,
        EntryStatus::Completed,
        OffsetDateTime::now_utc(),
    ))?;

    match rows.next()? {
        Some(row) => Ok(Some(map_entry_row(row)?)),
        None => Ok(None),
    }
}

/// Retrieve a ledger entry by its `id`.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to a valid entry,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_entry(id: LedgerEntryId, connection: &Connection) -> Result<LedgerEntry, Error> {
    connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entry WHERE id = :id"
        ))?
        .query_row(&[(":id", &id)], map_entry_row)
        .map_err(|error| error.into())
}

/// Retrieve a ledger entry by the provider's receipt number.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if no entry has the receipt number,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_entry_by_receipt(
    receipt_number: &str,
    connection: &Connection,
) -> Result<LedgerEntry, Error> {
    connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entry WHERE receipt_number = :receipt_number"
        ))?
        .query_row(&[(":receipt_number", receipt_number)], map_entry_row)
        .map_err(|error| error.into())
}

/// Retrieve the entry recorded for a checkout request.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if no entry answers the checkout request,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_entry_by_checkout_request(
    checkout_request_id: &str,
    connection: &Connection,
) -> Result<LedgerEntry, Error> {
    connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entry WHERE checkout_request_id = :checkout_request_id"
        ))?
        .query_row(&[(":checkout_request_id", checkout_request_id)], map_entry_row)
        .map_err(|error| error.into())
}

/// Retrieve all entries that could not be matched to a user, oldest first.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn get_unassociated_entries(connection: &Connection) -> Result<Vec<LedgerEntry>, Error> {
    connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entry WHERE user_id IS NULL ORDER BY id ASC"
        ))?
        .query_map([], map_entry_row)?
        .map(|maybe_entry| maybe_entry.map_err(|error| error.into()))
        .collect()
}

/// Get the total number of entries in the ledger.
///
/// # Errors
/// This function will return a [Error::SqlError] there is some SQL error.
pub fn count_entries(connection: &Connection) -> Result<u32, Error> {
    connection
        .query_row("SELECT COUNT(id) FROM ledger_entry", [], |row| row.get(0))
        .map_err(|error| error.into())
}

/// Set the status of an entry.
///
/// # Errors
/// Returns [Error::NotFound] if the entry does not exist.
pub fn set_entry_status(
    id: LedgerEntryId,
    status: EntryStatus,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE ledger_entry SET status = ?1 WHERE id = ?2",
        (status, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Replace the receipt number of an entry.
///
/// # Errors
/// Returns [Error::NotFound] if the entry does not exist.
pub fn set_entry_receipt(
    id: LedgerEntryId,
    receipt_number: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE ledger_entry SET receipt_number = ?1 WHERE id = ?2",
        (receipt_number, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Set the owner and category of an entry.
///
/// # Errors
/// Returns [Error::NotFound] if the entry does not exist.
pub fn set_entry_scope(
    id: LedgerEntryId,
    user_id: Option<UserID>,
    category_id: Option<CategoryId>,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE ledger_entry SET user_id = ?1, category_id = ?2 WHERE id = ?3",
        (user_id.map(|id| id.as_i64()), category_id, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Delete an entry.
///
/// # Errors
/// Returns [Error::NotFound] if the entry does not exist.
pub fn delete_entry(id: LedgerEntryId, connection: &Connection) -> Result<(), Error> {
    let rows_affected = connection.execute("DELETE FROM ledger_entry WHERE id = ?1", [id])?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Create the ledger table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_ledger_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_entry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                receipt_number TEXT NOT NULL UNIQUE,
                amount INTEGER NOT NULL,
                phone_number TEXT,
                user_id INTEGER,
                category_id INTEGER,
                checkout_request_id TEXT UNIQUE,
                transaction_date TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES user(id),
                FOREIGN KEY(category_id) REFERENCES category(id)
                );

        CREATE INDEX IF NOT EXISTS idx_ledger_entry_scope ON ledger_entry(user_id, category_id, status);",
    )?;

    Ok(())
}

/// Map a database row to a [LedgerEntry].
pub fn map_entry_row(row: &Row) -> Result<LedgerEntry, rusqlite::Error> {
    let raw_user_id: Option<i64> = row.get(4)?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        receipt_number: row.get(1)?,
        amount: row.get(2)?,
        phone_number: row.get(3)?,
        user_id: raw_user_id.map(UserID::new),
        category_id: row.get(5)?,
        checkout_request_id: row.get(6)?,
        transaction_date: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
