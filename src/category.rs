//! Spending categories and verification of category ownership.
//!
//! Category editing is handled elsewhere. The ledger only needs to know
//! whether a category requested for a payment actually belongs to the owner
//! the payment was resolved to.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

use crate::{Error, UserID, database_id::CategoryId};

/// A category that a user's spending is grouped under, e.g. "Groceries".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// The ID of the category.
    pub id: CategoryId,
    /// The user that owns the category.
    pub user_id: UserID,
    /// The display name of the category.
    pub name: String,
}

/// Checks that a category scope belongs to an owner before any of the owner's
/// payments are aggregated under it.
pub trait CategoryScopeResolver: Send + Sync {
    /// Whether `category_id` exists and is owned by `owner`.
    ///
    /// # Errors
    /// Returns an error if the lookup itself failed.
    fn category_belongs_to(&self, owner: UserID, category_id: CategoryId) -> Result<bool, Error>;
}

/// A [CategoryScopeResolver] backed by the application's category table.
#[derive(Debug, Clone)]
pub struct SqliteCategoryScopeResolver {
    db_connection: Arc<Mutex<Connection>>,
}

impl SqliteCategoryScopeResolver {
    /// Create a resolver that reads from `db_connection`.
    pub fn new(db_connection: Arc<Mutex<Connection>>) -> Self {
        Self { db_connection }
    }
}

impl CategoryScopeResolver for SqliteCategoryScopeResolver {
    fn category_belongs_to(&self, owner: UserID, category_id: CategoryId) -> Result<bool, Error> {
        let connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        let count: i64 = connection.query_row(
            "SELECT COUNT(id) FROM category WHERE id = ?1 AND user_id = ?2",
            (category_id, owner.as_i64()),
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }
}

/// Create a category for `user_id` and return it with its generated ID.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn create_category(
    name: &str,
    user_id: UserID,
    connection: &Connection,
) -> Result<Category, Error> {
    connection
        .prepare(
            "INSERT INTO category (name, user_id) VALUES (?1, ?2)
             RETURNING id, user_id, name",
        )?
        .query_row((name, user_id.as_i64()), map_row)
        .map_err(|error| error.into())
}

/// Create the category table.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_category_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS category (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES user(id) ON UPDATE CASCADE ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_category_user ON category(user_id);",
    )?;

    Ok(())
}

fn map_row(row: &Row) -> Result<Category, rusqlite::Error> {
    Ok(Category {
        id: row.get(0)?,
        user_id: UserID::new(row.get(1)?),
        name: row.get(2)?,
    })
}
