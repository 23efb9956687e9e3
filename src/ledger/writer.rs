//! The idempotent ledger writer.
//!
//! Every path that turns a provider result into money on the books goes
//! through [LedgerWriter]. It deduplicates by receipt number, associates the
//! payment with its owner and category, and recomputes the affected category
//! total in the same database transaction as the ledger change.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use rusqlite::{Connection, TransactionBehavior};

use crate::{
    AccountDirectory, Amount, CategoryScopeResolver, Error, UserID,
    aggregate::{AggregateUpdate, recompute_scope},
    database_id::{CategoryId, LedgerEntryId},
    events::{EventBus, LedgerEvent},
    ledger::core::{
        EntryStatus, LedgerEntry, PaymentResult, delete_entry, get_entry,
        get_entry_by_checkout_request, get_entry_by_receipt, insert_entry, is_provisional_receipt,
        set_entry_receipt, set_entry_scope, set_entry_status,
    },
    reconciliation::{
        NewReconciliationItem, ReconciliationKind, enqueue, resolve_items_for_receipt,
    },
};

/// The result of recording a payment.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The payment was new and a ledger entry was created.
    Created {
        /// The new entry.
        entry: LedgerEntry,
        /// The recomputed category total, `None` if the entry has no scope.
        aggregate: Option<AggregateUpdate>,
    },
    /// The receipt number was already in the ledger, nothing was written.
    Duplicate {
        /// The entry that was recorded on first delivery.
        entry: LedgerEntry,
    },
}

impl RecordOutcome {
    /// The entry for the payment's receipt number.
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            RecordOutcome::Created { entry, .. } | RecordOutcome::Duplicate { entry } => entry,
        }
    }

    /// Whether the payment had already been recorded.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RecordOutcome::Duplicate { .. })
    }
}

/// Writes payments to the ledger exactly once per receipt number and keeps
/// category totals consistent with the ledger.
#[derive(Clone)]
pub struct LedgerWriter {
    db_connection: Arc<Mutex<Connection>>,
    directory: Arc<dyn AccountDirectory>,
    scopes: Arc<dyn CategoryScopeResolver>,
    events: EventBus,
}

impl Debug for LedgerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerWriter")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl LedgerWriter {
    /// Create a ledger writer.
    ///
    /// The directory and scope resolver are called before the write
    /// transaction is opened, so they may use `db_connection` themselves.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        directory: Arc<dyn AccountDirectory>,
        scopes: Arc<dyn CategoryScopeResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            db_connection,
            directory,
            scopes,
            events,
        }
    }

    /// The event bus that ledger changes are published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Record a completed payment.
    ///
    /// If the receipt number or checkout request is already in the ledger
    /// this is a successful no-op that returns the existing entry, except
    /// that a real receipt number replaces a provisional one. Otherwise the payment is
    /// associated with the owner of its phone number and, if that owner owns
    /// `requested_category`, with that category. A payment nobody owns is
    /// stored unassociated and queued for review.
    ///
    /// # Errors
    /// Returns:
    /// - [Error::AggregateFailed] if the category total could not be
    ///   recomputed, in which case nothing is written,
    /// - [Error::DatabaseLockError] or [Error::SqlError] if the database could
    ///   not be used.
    pub fn record_payment(
        &self,
        payment: &PaymentResult,
        requested_category: Option<CategoryId>,
    ) -> Result<RecordOutcome, Error> {
        let owner = match &payment.phone_number {
            Some(phone_number) => self.directory.resolve_owner(phone_number)?,
            None => None,
        };
        let category_id = self.verify_scope(owner, requested_category, &payment.receipt_number)?;

        let mut connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = match insert_entry(payment, owner, category_id, &transaction)? {
            Some(entry) => entry,
            None => {
                let existing = find_recorded(payment, &transaction)?;

                if !existing.has_provisional_receipt()
                    || is_provisional_receipt(&payment.receipt_number)
                {
                    log_duplicate(payment, &existing);
                    return Ok(RecordOutcome::Duplicate { entry: existing });
                }

                set_entry_receipt(existing.id, &payment.receipt_number, &transaction)?;
                let confirmed = get_entry(existing.id, &transaction)?;
                transaction.commit()?;
                drop(connection);

                tracing::info!(
                    receipt_number = %confirmed.receipt_number,
                    checkout_request_id = confirmed.checkout_request_id.as_deref(),
                    "Confirmed receipt number of a payment recorded from a status query"
                );
                log_duplicate(payment, &confirmed);

                return Ok(RecordOutcome::Duplicate { entry: confirmed });
            }
        };

        let aggregate = match entry.scope() {
            Some(scope) => Some(recompute_scope(scope, entry.amount, &transaction)?),
            None => None,
        };

        if entry.is_unassociated() {
            let phone_number = entry
                .phone_number
                .as_ref()
                .map_or_else(|| "an unknown phone number".to_owned(), |phone| phone.to_string());

            enqueue(
                ReconciliationKind::UnassociatedFunds,
                NewReconciliationItem {
                    checkout_request_id: entry.checkout_request_id.as_deref(),
                    receipt_number: Some(&entry.receipt_number),
                    payload: None,
                    reason: &format!(
                        "received {} from {phone_number} which is not registered to any user",
                        entry.amount
                    ),
                },
                &transaction,
            )?;
        }

        transaction.commit()?;
        drop(connection);

        tracing::info!(
            receipt_number = %entry.receipt_number,
            amount = %entry.amount,
            user_id = entry.user_id.map(|id| id.as_i64()),
            category_id = entry.category_id,
            "Recorded payment in ledger"
        );

        self.events.publish(LedgerEvent::EntryCreated(entry.clone()));
        if let Some(update) = &aggregate {
            self.publish_aggregate(update);
        }

        Ok(RecordOutcome::Created { entry, aggregate })
    }

    /// Mark the entry for `receipt_number` as reversed so that it no longer
    /// counts towards its category total.
    ///
    /// Reversing an entry that is already reversed changes nothing.
    ///
    /// # Errors
    /// Returns [Error::NotFound] if no entry has the receipt number, or any of
    /// the errors of [LedgerWriter::record_payment].
    pub fn reverse_entry(&self, receipt_number: &str) -> Result<LedgerEntry, Error> {
        let mut connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = get_entry_by_receipt(receipt_number, &transaction)?;
        if entry.status == EntryStatus::Reversed {
            return Ok(entry);
        }

        set_entry_status(entry.id, EntryStatus::Reversed, &transaction)?;
        let update = match entry.scope() {
            Some(scope) => Some(recompute_scope(
                scope,
                Amount::ZERO - entry.contribution(),
                &transaction,
            )?),
            None => None,
        };
        let reversed = get_entry(entry.id, &transaction)?;

        transaction.commit()?;
        drop(connection);

        tracing::info!(receipt_number, "Reversed ledger entry");

        if let Some(update) = &update {
            self.publish_aggregate(update);
        }

        Ok(reversed)
    }

    /// Move an entry to a different owner and category.
    ///
    /// Both the old and the new category totals are recomputed. Assigning an
    /// unassociated entry to an owner settles its review item.
    ///
    /// # Errors
    /// Returns:
    /// - [Error::InvalidCategory] if `category_id` is set but not owned by
    ///   `owner`,
    /// - [Error::NotFound] if there is no entry with `entry_id`,
    /// - or any of the errors of [LedgerWriter::record_payment].
    pub fn reassign_entry(
        &self,
        entry_id: LedgerEntryId,
        owner: Option<UserID>,
        category_id: Option<CategoryId>,
    ) -> Result<LedgerEntry, Error> {
        if let Some(category_id) = category_id {
            let is_owned = match owner {
                Some(owner) => self.scopes.category_belongs_to(owner, category_id)?,
                None => false,
            };

            if !is_owned {
                return Err(Error::InvalidCategory(category_id));
            }
        }

        let mut connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let before = get_entry(entry_id, &transaction)?;
        set_entry_scope(entry_id, owner, category_id, &transaction)?;
        let after = get_entry(entry_id, &transaction)?;

        let mut updates = Vec::with_capacity(2);
        match (before.scope(), after.scope()) {
            (Some(old), Some(new)) if old == new => {
                updates.push(recompute_scope(old, Amount::ZERO, &transaction)?);
            }
            (old, new) => {
                if let Some(old) = old {
                    updates.push(recompute_scope(
                        old,
                        Amount::ZERO - before.contribution(),
                        &transaction,
                    )?);
                }
                if let Some(new) = new {
                    updates.push(recompute_scope(new, after.contribution(), &transaction)?);
                }
            }
        }

        if before.is_unassociated() && !after.is_unassociated() {
            resolve_items_for_receipt(
                ReconciliationKind::UnassociatedFunds,
                &after.receipt_number,
                &transaction,
            )?;
        }

        transaction.commit()?;
        drop(connection);

        tracing::info!(
            entry_id,
            user_id = owner.map(|id| id.as_i64()),
            category_id,
            "Reassigned ledger entry"
        );

        for update in &updates {
            self.publish_aggregate(update);
        }

        Ok(after)
    }

    /// Delete an entry and recompute its category total.
    ///
    /// # Errors
    /// Returns [Error::NotFound] if there is no entry with `entry_id`, or any
    /// of the errors of [LedgerWriter::record_payment].
    pub fn delete_entry(&self, entry_id: LedgerEntryId) -> Result<LedgerEntry, Error> {
        let mut connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = get_entry(entry_id, &transaction)?;
        delete_entry(entry_id, &transaction)?;
        let update = match entry.scope() {
            Some(scope) => Some(recompute_scope(
                scope,
                Amount::ZERO - entry.contribution(),
                &transaction,
            )?),
            None => None,
        };

        transaction.commit()?;
        drop(connection);

        tracing::info!(entry_id, receipt_number = %entry.receipt_number, "Deleted ledger entry");

        if let Some(update) = &update {
            self.publish_aggregate(update);
        }

        Ok(entry)
    }

    fn verify_scope(
        &self,
        owner: Option<UserID>,
        requested_category: Option<CategoryId>,
        receipt_number: &str,
    ) -> Result<Option<CategoryId>, Error> {
        let (Some(owner), Some(category_id)) = (owner, requested_category) else {
            return Ok(None);
        };

        if self.scopes.category_belongs_to(owner, category_id)? {
            Ok(Some(category_id))
        } else {
            tracing::warn!(
                receipt_number,
                user_id = %owner,
                category_id,
                "Requested category does not belong to the payer, recording the payment uncategorized"
            );
            Ok(None)
        }
    }

    fn publish_aggregate(&self, update: &AggregateUpdate) {
        if update.changed() {
            self.events.publish(LedgerEvent::AggregateChanged {
                scope: update.scope,
                previous: update.previous,
                spent: update.spent,
            });
        }
    }
}

/// The entry that made the insert of `payment` conflict.
fn find_recorded(payment: &PaymentResult, connection: &Connection) -> Result<LedgerEntry, Error> {
    match get_entry_by_receipt(&payment.receipt_number, connection) {
        Err(Error::NotFound) => match &payment.checkout_request_id {
            Some(checkout_request_id) => {
                get_entry_by_checkout_request(checkout_request_id, connection)
            }
            None => Err(Error::NotFound),
        },
        result => result,
    }
}

fn log_duplicate(payment: &PaymentResult, existing: &LedgerEntry) {
    if payment.amount != existing.amount {
        tracing::warn!(
            receipt_number = %payment.receipt_number,
            recorded_amount = %existing.amount,
            delivered_amount = %payment.amount,
            "Duplicate delivery disagrees with the recorded amount, keeping the recorded entry"
        );
    } else if payment.receipt_number != existing.receipt_number
        && !is_provisional_receipt(&payment.receipt_number)
    {
        tracing::warn!(
            checkout_request_id = payment.checkout_request_id.as_deref(),
            recorded_receipt_number = %existing.receipt_number,
            delivered_receipt_number = %payment.receipt_number,
            "Checkout request is already recorded under another receipt number, keeping the recorded entry"
        );
    } else {
        tracing::debug!(
            receipt_number = %payment.receipt_number,
            "Ignoring duplicate delivery of a recorded payment"
        );
    }
}
