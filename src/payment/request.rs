//! Payment requests: the record that correlates an STK push with its result.

use rusqlite::{
    Connection, Row,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Amount, Error, PhoneNumber,
    database_id::{CategoryId, PaymentRequestId},
};

/// Where a payment request is in its lifecycle.
///
/// `Requested` moves to `Succeeded` or `Failed` when the provider reports a
/// result, or to `TimedOut` when the poller gives up. A success reported after
/// a time out still moves the request to `Succeeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Waiting for the provider to report a result.
    Requested,
    /// The customer paid.
    Succeeded,
    /// The payment did not go through.
    Failed,
    /// No result was received in time.
    TimedOut,
}

impl PaymentState {
    fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Requested => "requested",
            PaymentState::Succeeded => "succeeded",
            PaymentState::Failed => "failed",
            PaymentState::TimedOut => "timed_out",
        }
    }
}

impl ToSql for PaymentState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PaymentState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "requested" => Ok(PaymentState::Requested),
            "succeeded" => Ok(PaymentState::Succeeded),
            "failed" => Ok(PaymentState::Failed),
            "timed_out" => Ok(PaymentState::TimedOut),
            other => Err(FromSqlError::Other(
                format!("unknown payment state \"{other}\"").into(),
            )),
        }
    }
}

/// An STK push that the provider accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRequest {
    /// The ID of the request.
    pub id: PaymentRequestId,
    /// The provider's ID for the merchant side of the request.
    pub merchant_request_id: String,
    /// The provider's ID for the checkout, unique per request.
    pub checkout_request_id: String,
    /// The phone that was prompted to pay.
    pub phone_number: PhoneNumber,
    /// The requested amount.
    pub amount: Amount,
    /// The reference shown to the customer.
    pub account_reference: String,
    /// The category the payment should be recorded under, if any.
    pub category_id: Option<CategoryId>,
    /// Where the request is in its lifecycle.
    pub state: PaymentState,
    /// The provider's result code, once known.
    pub result_code: Option<String>,
    /// The provider's result description, once known.
    pub result_description: Option<String>,
    /// The receipt of the payment, once known.
    pub receipt_number: Option<String>,
    /// How many times the poller has queried the provider.
    pub poll_attempts: u32,
    /// When the request was sent.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the request was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The data needed to store a new payment request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentRequest {
    /// The provider's ID for the merchant side of the request.
    pub merchant_request_id: String,
    /// The provider's ID for the checkout.
    pub checkout_request_id: String,
    /// The phone that was prompted to pay.
    pub phone_number: PhoneNumber,
    /// The requested amount.
    pub amount: Amount,
    /// The reference shown to the customer.
    pub account_reference: String,
    /// The category the payment should be recorded under, if any.
    pub category_id: Option<CategoryId>,
}

const REQUEST_COLUMNS: &str = "id, merchant_request_id, checkout_request_id, phone_number, amount, \
     account_reference, category_id, state, result_code, result_description, receipt_number, \
     poll_attempts, created_at, updated_at";

/// Store a new request in the `Requested` state.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error, e.g. the checkout
/// request ID is already stored.
pub fn insert_payment_request(
    request: NewPaymentRequest,
    created_at: OffsetDateTime,
    connection: &Connection,
) -> Result<PaymentRequest, Error> {
    connection
        .prepare(&format!(
            "INSERT INTO payment_request
                (merchant_request_id, checkout_request_id, phone_number, amount, account_reference,
                 category_id, state, poll_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
             RETURNING {REQUEST_COLUMNS}"
        ))?
        .query_row(
            (
                request.merchant_request_id,
                request.checkout_request_id,
                request.phone_number,
                request.amount,
                request.account_reference,
                request.category_id,
                PaymentState::Requested,
                created_at,
            ),
            map_row,
        )
        .map_err(|error| error.into())
}

/// Retrieve a request by its checkout request ID.
///
/// # Errors
/// Returns [Error::NotFound] if there is no such request.
pub fn get_payment_request(
    checkout_request_id: &str,
    connection: &Connection,
) -> Result<PaymentRequest, Error> {
    connection
        .prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM payment_request WHERE checkout_request_id = ?1"
        ))?
        .query_row([checkout_request_id], map_row)
        .map_err(|error| error.into())
}

/// Mark a request as paid.
///
/// Allowed from every state except `Failed`. A receipt number that is already
/// stored is kept.
///
/// Returns whether the request changed.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn mark_succeeded(
    checkout_request_id: &str,
    receipt_number: Option<&str>,
    result_description: &str,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_affected = connection.execute(
        "UPDATE payment_request
         SET state = ?1,
             result_code = '0',
             result_description = ?2,
             receipt_number = COALESCE(receipt_number, ?3),
             updated_at = ?4
         WHERE checkout_request_id = ?5 AND state IN (?6, ?7, ?1)",
        (
            PaymentState::Succeeded,
            result_description,
            receipt_number,
            OffsetDateTime::now_utc(),
            checkout_request_id,
            PaymentState::Requested,
            PaymentState::TimedOut,
        ),
    )?;

    Ok(rows_affected > 0)
}

/// Mark a request as failed and store the provider's reason.
///
/// Only a `Requested` request can fail, a reported failure never overrides a
/// success.
///
/// Returns whether the request changed.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn mark_failed(
    checkout_request_id: &str,
    result_code: &str,
    result_description: &str,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_affected = connection.execute(
        "UPDATE payment_request
         SET state = ?1, result_code = ?2, result_description = ?3, updated_at = ?4
         WHERE checkout_request_id = ?5 AND state = ?6",
        (
            PaymentState::Failed,
            result_code,
            result_description,
            OffsetDateTime::now_utc(),
            checkout_request_id,
            PaymentState::Requested,
        ),
    )?;

    Ok(rows_affected > 0)
}

/// Mark a `Requested` request as timed out.
///
/// Returns whether the request changed.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn mark_timed_out(checkout_request_id: &str, connection: &Connection) -> Result<bool, Error> {
    let rows_affected = connection.execute(
        "UPDATE payment_request SET state = ?1, updated_at = ?2
         WHERE checkout_request_id = ?3 AND state = ?4",
        (
            PaymentState::TimedOut,
            OffsetDateTime::now_utc(),
            checkout_request_id,
            PaymentState::Requested,
        ),
    )?;

    Ok(rows_affected > 0)
}

/// Count a status query for a request.
///
/// # Errors
/// Returns [Error::NotFound] if there is no such request.
pub fn record_poll_attempt(checkout_request_id: &str, connection: &Connection) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE payment_request SET poll_attempts = poll_attempts + 1, updated_at = ?1
         WHERE checkout_request_id = ?2",
        (OffsetDateTime::now_utc(), checkout_request_id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Retrieve up to `limit` `Requested` requests created before `cutoff`,
/// oldest first.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn get_overdue_requests(
    cutoff: OffsetDateTime,
    limit: u32,
    connection: &Connection,
) -> Result<Vec<PaymentRequest>, Error> {
    connection
        .prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM payment_request
             WHERE state = ?1 AND created_at < ?2
             ORDER BY created_at ASC
             LIMIT ?3"
        ))?
        .query_map((PaymentState::Requested, cutoff, limit), map_row)?
        .map(|maybe_request| maybe_request.map_err(|error| error.into()))
        .collect()
}

/// Delete resolved requests that were last changed before `older_than`.
///
/// `Requested` requests are never deleted.
///
/// Returns the number of deleted requests.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn purge_resolved_requests(
    older_than: OffsetDateTime,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "DELETE FROM payment_request WHERE state != ?1 AND updated_at < ?2",
            (PaymentState::Requested, older_than),
        )
        .map_err(|error| error.into())
}

/// Create the payment request table.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_payment_request_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS payment_request (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                merchant_request_id TEXT NOT NULL,
                checkout_request_id TEXT NOT NULL UNIQUE,
                phone_number TEXT NOT NULL,
                amount INTEGER NOT NULL,
                account_reference TEXT NOT NULL,
                category_id INTEGER,
                state TEXT NOT NULL,
                result_code TEXT,
                result_description TEXT,
                receipt_number TEXT,
                poll_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
                );

        CREATE INDEX IF NOT EXISTS idx_payment_request_state ON payment_request(state, created_at);",
    )?;

    Ok(())
}

fn map_row(row: &Row) -> Result<PaymentRequest, rusqlite::Error> {
    Ok(PaymentRequest {
        id: row.get(0)?,
        merchant_request_id: row.get(1)?,
        checkout_request_id: row.get(2)?,
        phone_number: row.get(3)?,
        amount: row.get(4)?,
        account_reference: row.get(5)?,
        category_id: row.get(6)?,
        state: row.get(7)?,
        result_code: row.get(8)?,
        result_description: row.get(9)?,
        receipt_number: row.get(10)?,
        poll_attempts: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}
