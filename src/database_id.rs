//! Database ID type definitions.

/// Alias for the integer type used for mapping to database IDs.
pub type DatabaseId = i64;
/// The ID of a row in the ledger.
pub type LedgerEntryId = i64;
/// The ID of a spending category.
pub type CategoryId = i64;
/// The ID of a payment request (the local row, not the provider's identifiers).
pub type PaymentRequestId = i64;
/// The ID of an item in the reconciliation queue.
pub type ReconciliationItemId = i64;
