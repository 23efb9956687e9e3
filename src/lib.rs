//! Mobile-money payment reconciliation for the budgeting backend.
//!
//! This library sends M-Pesa push-payment (STK push) requests, receives the
//! provider's asynchronous result callbacks, and turns them into a
//! deduplicated ledger. A per-category "spent" aggregate is kept consistent
//! with the ledger by recomputing it from source on every change.
//!
//! When no callback arrives in time a background poller asks the provider for
//! the result and feeds it through the same ledger writer, so a late callback
//! and a poll result for the same payment can never produce two entries.

#![warn(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_server::Handle;
use serde_json::json;
use tokio::signal;

mod aggregate;
mod amount;
mod app_state;
mod callback;
mod category;
mod database_id;
mod db;
mod endpoints;
mod events;
mod ledger;
mod logging;
mod mpesa;
mod payment;
mod phone;
mod poller;
mod rate_limit;
mod reconciliation;
mod routing;
mod settlement;
mod timezone;
mod user;

pub use aggregate::{
    AggregateDrift, AggregateUpdate, CategoryAggregate, Scope, audit_aggregates, get_aggregate,
};
pub use amount::Amount;
pub use app_state::AppState;
pub use callback::{CALLBACK_ACKNOWLEDGEMENT, CallbackQueue, run_callback_worker};
pub use category::{Category, CategoryScopeResolver, SqliteCategoryScopeResolver, create_category};
pub use database_id::{CategoryId, LedgerEntryId, PaymentRequestId, ReconciliationItemId};
pub use db::initialize as initialize_db;
pub use events::{EventBus, LedgerEvent};
pub use ledger::{
    EntryStatus, LedgerEntry, LedgerWriter, PaymentResult, RecordOutcome, count_entries,
    get_entry, get_entry_by_receipt, get_unassociated_entries,
};
pub use logging::{LOG_BODY_LENGTH_LIMIT, logging_middleware};
pub use mpesa::{
    MpesaClient, MpesaConfig, PaymentProvider, ProviderError, ProviderOutcome, SANDBOX_BASE_URL,
};
pub use payment::{
    InitiatePayment, PaymentInitiator, PaymentRequest, PaymentState, get_payment_request,
};
pub use phone::PhoneNumber;
pub use poller::{PollSummary, PollerConfig, StatusPoller};
pub use rate_limit::RateLimiter;
pub use reconciliation::{ReconciliationItem, ReconciliationKind, get_unresolved};
pub use routing::build_router;
pub use settlement::{ReplaySummary, Settled, Settlement};
pub use timezone::{PROVIDER_TIMEZONE, get_local_offset};
pub use user::{AccountDirectory, SqliteAccountDirectory, UserID, create_user};

/// An async task that waits for either the ctrl+c or terminate signal, whichever comes first, and
/// then signals the server to shut down gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle<SocketAddr>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The phone number could not be normalized into the `254XXXXXXXXX` form.
    #[error("\"{0}\" is not a valid phone number")]
    InvalidPhoneNumber(String),

    /// The amount is not a positive, whole number of shillings.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A compact `YYYYMMDDHHMMSS` timestamp could not be parsed.
    #[error("invalid timestamp \"{0}\"")]
    InvalidTimestamp(String),

    /// The category does not exist or does not belong to the entry's owner.
    #[error("category {0} does not belong to the owner")]
    InvalidCategory(CategoryId),

    /// Too many payment requests were made for the same phone number.
    #[error("too many payment requests, try again later")]
    RateLimited,

    /// A call to the provider failed in a way that may succeed if retried,
    /// e.g. a network error, an expired token or a 5xx response.
    #[error("the payment provider is unavailable: {0}")]
    TransientProvider(String),

    /// The provider rejected the request.
    #[error("the payment provider rejected the request: {0}")]
    ProviderRejected(String),

    /// A success-coded callback was missing a field required for a ledger entry.
    ///
    /// Nothing is written to the ledger for these callbacks. They are logged
    /// and queued for reconciliation instead.
    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    /// The category aggregate could not be recomputed, so the ledger write
    /// that triggered it was rolled back.
    #[error("could not recompute the category aggregate: {0}")]
    AggregateFailed(String),

    /// The requested resource was not found.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),

    /// An error occurred while serializing a struct as JSON.
    #[error("could not serialize as JSON: {0}")]
    JSONSerializationError(String),

    /// Could not acquire the database lock.
    #[error("could not acquire the database lock")]
    DatabaseLockError,

    /// The canonical timezone string does not name a known timezone.
    #[error("invalid timezone {0}")]
    InvalidTimezoneError(String),
}

impl Error {
    /// Whether the operation that produced this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientProvider(_)
                | Error::AggregateFailed(_)
                | Error::DatabaseLockError
                | Error::SqlError(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::JSONSerializationError(value.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidPhoneNumber(_) | Error::InvalidAmount(_) | Error::InvalidCategory(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::TransientProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            // Any errors that are not handled above are not intended to be shown to the client.
            error => {
                tracing::error!("An unexpected error occurred: {}", error);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "An unexpected error occurred, check the server logs for more details.",
                        "retryable": error.is_retryable(),
                    })),
                )
                    .into_response();
            }
        };

        (
            status,
            Json(json!({
                "error": self.to_string(),
                "retryable": self.is_retryable(),
            })),
        )
            .into_response()
    }
}
