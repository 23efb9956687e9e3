//! The payment ledger and its idempotent writer.

mod core;
mod writer;

pub use core::{
    EntryStatus, LedgerEntry, PaymentResult, count_entries, create_ledger_table, get_entry,
    get_entry_by_checkout_request, get_entry_by_receipt, get_unassociated_entries,
    is_provisional_receipt, provisional_receipt,
};
pub use writer::{LedgerWriter, RecordOutcome};
