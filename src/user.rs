//! The account directory: maps payer phone numbers to the users who own them.
//!
//! Registration and login live elsewhere; this module only needs enough of the
//! user table to resolve the owner of an incoming payment.

use std::{
    fmt::Display,
    sync::{Arc, Mutex},
};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{Error, PhoneNumber};

/// A newtype wrapper for integer user IDs.
///
/// This helps disambiguate user IDs from other types of IDs, leading to better compile time
/// errors, and more flexible generics that can have distinct implementations for multiple ID types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct UserID(i64);

impl UserID {
    /// Create a new user ID.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Cast the user ID to a 64 bit integer.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for UserID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Resolves the owner of a payment from the payer's phone number.
pub trait AccountDirectory: Send + Sync {
    /// Find the user registered with `phone_number`, if any.
    ///
    /// # Errors
    /// Returns an error if the directory could not be queried. `Ok(None)` means
    /// the lookup succeeded and nobody owns the number.
    fn resolve_owner(&self, phone_number: &PhoneNumber) -> Result<Option<UserID>, Error>;
}

/// An [AccountDirectory] backed by the application's user table.
#[derive(Debug, Clone)]
pub struct SqliteAccountDirectory {
    db_connection: Arc<Mutex<Connection>>,
}

impl SqliteAccountDirectory {
    /// Create a directory that reads from `db_connection`.
    pub fn new(db_connection: Arc<Mutex<Connection>>) -> Self {
        Self { db_connection }
    }
}

impl AccountDirectory for SqliteAccountDirectory {
    fn resolve_owner(&self, phone_number: &PhoneNumber) -> Result<Option<UserID>, Error> {
        let connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        get_user_by_phone_number(phone_number, &connection)
    }
}

/// Create the user table.
///
/// # Errors
///
/// This function will return an error if the SQL query failed.
pub fn create_user_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS user (
                id INTEGER PRIMARY KEY,
                phone_number TEXT NOT NULL UNIQUE
                )",
        (),
    )?;

    Ok(())
}

/// Create and insert a new user into the database.
///
/// # Errors
///
/// Returns a [Error::SqlError] if an SQL related error occurred, e.g. the
/// phone number is already registered.
pub fn create_user(phone_number: &PhoneNumber, connection: &Connection) -> Result<UserID, Error> {
    connection.execute("INSERT INTO user (phone_number) VALUES (?1)", (phone_number,))?;

    Ok(UserID::new(connection.last_insert_rowid()))
}

/// Get the ID of the user registered with `phone_number`.
///
/// # Errors
///
/// Returns a [Error::SqlError] if an SQL related error occurred.
pub fn get_user_by_phone_number(
    phone_number: &PhoneNumber,
    connection: &Connection,
) -> Result<Option<UserID>, Error> {
    connection
        .prepare("SELECT id FROM user WHERE phone_number = :phone_number")?
        .query_row(&[(":phone_number", phone_number)], |row| {
            row.get(0).map(UserID::new)
        })
        .optional()
        .map_err(|error| error.into())
}
