//! Maintains the per-category "spent" aggregate.
//!
//! The aggregate is a materialized view of the ledger: it is always
//! recomputed as the full sum of completed entries in its scope and never
//! adjusted by increments. The previously cached value is only used to detect
//! drift, and the recomputed value always replaces it.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Amount, Error, UserID, database_id::CategoryId};

/// How far a recomputed total may differ from the expected total before it is
/// reported as drift.
pub const DRIFT_TOLERANCE: Amount = Amount::ZERO;

/// An (owner, category) pair that ledger entries are aggregated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// The owner of the entries.
    pub user_id: UserID,
    /// The category the entries are grouped under.
    pub category_id: CategoryId,
}

/// The cached total of a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryAggregate {
    /// The scope the total belongs to.
    pub scope: Scope,
    /// The sum of all completed ledger entries in the scope.
    pub spent: Amount,
    /// When the total was last recomputed.
    pub updated_at: OffsetDateTime,
}

/// A recomputed total that disagreed with the value the cache should have had.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateDrift {
    /// The scope that drifted.
    pub scope: Scope,
    /// The cached value plus the change the triggering mutation should cause.
    pub expected: Amount,
    /// The value recomputed from the ledger, which replaces the cached value.
    pub recomputed: Amount,
}

/// The result of recomputing a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateUpdate {
    /// The recomputed scope.
    pub scope: Scope,
    /// The cached total before recomputation.
    pub previous: Amount,
    /// The recomputed total.
    pub spent: Amount,
    /// Set when the recomputed total disagreed with the expected total.
    pub drift: Option<AggregateDrift>,
}

impl AggregateUpdate {
    /// Whether the cached total changed.
    pub fn changed(&self) -> bool {
        self.previous != self.spent
    }
}

/// Recompute the total of `scope` from the ledger and store it.
///
/// `expected_delta` is the change to the total that the mutation which
/// triggered the recomputation should cause, e.g. the amount of a new entry or
/// the negated amount of a reversed entry. Pass zero to verify a scope.
///
/// The caller must run this inside the same database transaction as the
/// ledger mutation so that concurrent recomputations of a scope are
/// serialized by the database's write lock.
///
/// # Errors
/// Returns [Error::AggregateFailed] if the ledger could not be summed or the
/// total could not be stored.
pub fn recompute_scope(
    scope: Scope,
    expected_delta: Amount,
    connection: &Connection,
) -> Result<AggregateUpdate, Error> {
    recompute_scope_inner(scope, expected_delta, connection)
        .map_err(|error| Error::AggregateFailed(format!("scope {scope:?}: {error}")))
}

fn recompute_scope_inner(
    scope: Scope,
    expected_delta: Amount,
    connection: &Connection,
) -> Result<AggregateUpdate, rusqlite::Error> {
    let previous: Amount = connection
        .query_row(
            "SELECT spent FROM category_aggregate WHERE user_id = ?1 AND category_id = ?2",
            (scope.user_id.as_i64(), scope.category_id),
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_default();

    let spent = sum_scope(scope, connection)?;

    connection.execute(
        "INSERT INTO category_aggregate (user_id, category_id, spent, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, category_id) DO UPDATE SET
            spent = excluded.spent,
            updated_at = excluded.updated_at",
        (
            scope.user_id.as_i64(),
            scope.category_id,
            spent,
            OffsetDateTime::now_utc(),
        ),
    )?;

    let expected = previous + expected_delta;
    let drifted = spent.checked_sub(expected).is_none_or(|difference| {
        difference.cents().unsigned_abs() > DRIFT_TOLERANCE.cents().unsigned_abs()
    });
    let drift = if drifted {
        tracing::error!(
            user_id = %scope.user_id,
            category_id = scope.category_id,
            expected = %expected,
            recomputed = %spent,
            "AggregateDriftDetected: cached category total disagreed with the ledger"
        );

        Some(AggregateDrift {
            scope,
            expected,
            recomputed: spent,
        })
    } else {
        None
    };

    Ok(AggregateUpdate {
        scope,
        previous,
        spent,
        drift,
    })
}

/// Sum the completed ledger entries in `scope`.
///
/// # Errors
/// Returns an error if there is an SQL error.
pub fn sum_scope(scope: Scope, connection: &Connection) -> Result<Amount, rusqlite::Error> {
    connection.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entry
         WHERE user_id = ?1 AND category_id = ?2 AND status = 'completed'",
        (scope.user_id.as_i64(), scope.category_id),
        |row| row.get(0),
    )
}

/// Get the cached total for `scope`.
///
/// A scope that has never had an entry has a total of zero.
///
/// # Errors
/// Returns a [Error::SqlError] if there is an SQL error.
pub fn get_aggregate(scope: Scope, connection: &Connection) -> Result<CategoryAggregate, Error> {
    let cached = connection
        .query_row(
            "SELECT spent, updated_at FROM category_aggregate
             WHERE user_id = ?1 AND category_id = ?2",
            (scope.user_id.as_i64(), scope.category_id),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (spent, updated_at) = cached.unwrap_or((Amount::ZERO, OffsetDateTime::UNIX_EPOCH));

    Ok(CategoryAggregate {
        scope,
        spent,
        updated_at,
    })
}

/// Recompute every scope that has ledger entries or a cached total.
///
/// Each scope is recomputed in its own transaction with an expected change of
/// zero, so any difference between the cache and the ledger is reported as
/// drift and then corrected.
///
/// # Errors
/// Returns an error if a scope could not be recomputed. Scopes recomputed
/// before the failure keep their corrected totals.
pub fn audit_aggregates(connection: &mut Connection) -> Result<Vec<AggregateDrift>, Error> {
    let scopes: Vec<Scope> = connection
        .prepare(
            "SELECT user_id, category_id FROM ledger_entry
             WHERE user_id IS NOT NULL AND category_id IS NOT NULL
             UNION
             SELECT user_id, category_id FROM category_aggregate",
        )?
        .query_map([], |row| {
            Ok(Scope {
                user_id: UserID::new(row.get(0)?),
                category_id: row.get(1)?,
            })
        })?
        .collect::<Result<_, _>>()?;

    let mut drifts = Vec::new();

    for scope in scopes {
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let update = recompute_scope(scope, Amount::ZERO, &transaction)?;
        transaction.commit()?;

        if let Some(drift) = update.drift {
            drifts.push(drift);
        }
    }

    tracing::debug!("Audited category aggregates, found {} drifted", drifts.len());

    Ok(drifts)
}

/// Create the category aggregate table.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_aggregate_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS category_aggregate (
                user_id INTEGER NOT NULL,
                category_id INTEGER NOT NULL,
                spent INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(user_id, category_id)
                )",
        (),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use crate::{Amount, PhoneNumber, UserID, category::create_category, db::initialize, user::create_user};

    use super::{Scope, audit_aggregates, get_aggregate, recompute_scope};

    fn get_test_connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        initialize(&connection).unwrap();
        connection
    }

    fn create_scope(connection: &Connection) -> Scope {
        let user_id = create_user(&PhoneNumber::new_unchecked("254712345678"), connection).unwrap();
        let category = create_category("Groceries", user_id, connection).unwrap();

        Scope {
            user_id,
            category_id: category.id,
        }
    }

    fn insert_entry(receipt: &str, cents: i64, status: &str, scope: Scope, connection: &Connection) {
        connection
            .execute(
                "INSERT INTO ledger_entry
                    (receipt_number, amount, user_id, category_id, transaction_date, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, '2025-01-01T00:00:00Z', ?5, '2025-01-01T00:00:00Z')",
                (receipt, cents, scope.user_id.as_i64(), scope.category_id, status),
            )
            .unwrap();
    }

    #[test]
    fn recompute_sums_only_completed_entries() {
        let connection = get_test_connection();
        let scope = create_scope(&connection);
        insert_entry("A", 500, "completed", scope, &connection);
        insert_entry("B", 250, "completed", scope, &connection);
        insert_entry("C", 10_000, "reversed", scope, &connection);

        let update = recompute_scope(scope, Amount::from_cents(750), &connection).unwrap();

        assert_eq!(update.previous, Amount::ZERO);
        assert_eq!(update.spent, Amount::from_cents(750));
        assert_eq!(update.drift, None);
        assert_eq!(get_aggregate(scope, &connection).unwrap().spent, Amount::from_cents(750));
    }

    #[test]
    fn recompute_ignores_other_scopes() {
        let connection = get_test_connection();
        let scope = create_scope(&connection);
        let other = Scope {
            user_id: scope.user_id,
            category_id: create_category("Rent", scope.user_id, &connection).unwrap().id,
        };
        insert_entry("A", 500, "completed", scope, &connection);
        insert_entry("B", 700, "completed", other, &connection);

        let update = recompute_scope(scope, Amount::from_cents(500), &connection).unwrap();

        assert_eq!(update.spent, Amount::from_cents(500));
    }

    #[test]
    fn recompute_reports_drift_and_overwrites_cache() {
        let connection = get_test_connection();
        let scope = create_scope(&connection);
        insert_entry("A", 500, "completed", scope, &connection);
        recompute_scope(scope, Amount::from_cents(500), &connection).unwrap();
        connection
            .execute("UPDATE category_aggregate SET spent = 123", ())
            .unwrap();

        let update = recompute_scope(scope, Amount::ZERO, &connection).unwrap();

        let drift = update.drift.expect("expected drift to be reported");
        assert_eq!(drift.expected, Amount::from_cents(123));
        assert_eq!(drift.recomputed, Amount::from_cents(500));
        assert_eq!(get_aggregate(scope, &connection).unwrap().spent, Amount::from_cents(500));
    }

    #[test]
    fn unknown_scope_has_zero_total() {
        let connection = get_test_connection();
        let scope = Scope {
            user_id: UserID::new(99),
            category_id: 99,
        };

        assert_eq!(get_aggregate(scope, &connection).unwrap().spent, Amount::ZERO);
    }

    #[test]
    fn audit_corrects_every_drifted_scope() {
        let mut connection = get_test_connection();
        let scope = create_scope(&connection);
        insert_entry("A", 500, "completed", scope, &connection);
        // Simulate a cache that missed the insert entirely.
        let drifts = audit_aggregates(&mut connection).unwrap();

        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].scope, scope);
        assert_eq!(get_aggregate(scope, &connection).unwrap().spent, Amount::from_cents(500));

        let drifts = audit_aggregates(&mut connection).unwrap();
        assert!(drifts.is_empty(), "want no drift after correction, got {drifts:?}");
    }
}
