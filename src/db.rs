//! Creates the application's database schema.

use rusqlite::{Connection, Transaction as SqlTransaction, TransactionBehavior};

use crate::{
    Error,
    aggregate::create_aggregate_table,
    category::create_category_table,
    ledger::create_ledger_table,
    payment::create_payment_request_table,
    reconciliation::create_reconciliation_table,
    user::create_user_table,
};

/// Create the tables for every model in a single exclusive transaction.
///
/// Safe to call on an existing database, tables that already exist are left
/// untouched.
///
/// # Errors
/// Returns an error if any table could not be created. No tables are created
/// in that case.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    let transaction = SqlTransaction::new_unchecked(connection, TransactionBehavior::Exclusive)?;

    create_user_table(&transaction)?;
    create_category_table(&transaction)?;
    create_ledger_table(&transaction)?;
    create_aggregate_table(&transaction)?;
    create_payment_request_table(&transaction)?;
    create_reconciliation_table(&transaction)?;

    transaction.commit()?;

    Ok(())
}
