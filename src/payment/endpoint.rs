//! HTTP handlers for starting payments and checking on them.

use std::sync::{Arc, Mutex};

use axum::{
    Json,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    Amount, AppState, Error,
    database_id::CategoryId,
    mpesa::PaymentProvider,
    payment::{
        initiator::{InitiatePayment, PaymentInitiator},
        request::get_payment_request,
    },
};

/// The state needed by the payment endpoints.
#[derive(Clone)]
pub struct PaymentApiState {
    /// The database connection for reading payment requests.
    pub db_connection: Arc<Mutex<Connection>>,
    /// Sends new payment requests.
    pub initiator: PaymentInitiator,
    /// The provider, used directly for account queries.
    pub provider: Arc<dyn PaymentProvider>,
}

impl FromRef<AppState> for PaymentApiState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            initiator: state.initiator.clone(),
            provider: state.provider.clone(),
        }
    }
}

/// The JSON body for starting a payment.
#[derive(Debug, Deserialize)]
pub struct InitiatePaymentBody {
    /// The payer's phone number.
    pub phone_number: String,
    /// The amount in shillings, as a number or numeric string.
    pub amount: Value,
    /// The reference shown to the customer.
    #[serde(default)]
    pub account_reference: Option<String>,
    /// A short description of the payment.
    #[serde(default)]
    pub description: Option<String>,
    /// The category to record the payment under.
    #[serde(default)]
    pub category_id: Option<CategoryId>,
}

/// A route handler that sends an STK push and responds with the stored
/// request. The payment is not complete until the provider reports back, so
/// the response is `202 Accepted`.
pub async fn initiate_payment_endpoint(
    State(state): State<PaymentApiState>,
    Json(body): Json<InitiatePaymentBody>,
) -> Response {
    let Some(amount) = Amount::from_json(&body.amount) else {
        return Error::InvalidAmount(format!("{} is not an amount", body.amount)).into_response();
    };

    let payment = InitiatePayment {
        phone_number: body.phone_number,
        amount,
        account_reference: body.account_reference,
        description: body.description,
        category_id: body.category_id,
    };

    match state.initiator.initiate(payment).await {
        Ok(request) => (StatusCode::ACCEPTED, Json(request)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// A route handler that responds with the current state of a payment request.
pub async fn get_payment_endpoint(
    State(state): State<PaymentApiState>,
    Path(checkout_request_id): Path<String>,
) -> Response {
    let connection = match state.db_connection.lock() {
        Ok(connection) => connection,
        Err(error) => {
            tracing::error!("Could not acquire database lock: {error}");
            return Error::DatabaseLockError.into_response();
        }
    };

    match get_payment_request(&checkout_request_id, &connection) {
        Ok(request) => Json(request).into_response(),
        Err(error) => error.into_response(),
    }
}

/// A route handler that asks the provider to report the business account
/// balance. The provider delivers the balance to its configured result URL.
pub async fn request_balance_endpoint(State(state): State<PaymentApiState>) -> Response {
    match state.provider.request_account_balance().await {
        Ok(acknowledgement) => (StatusCode::ACCEPTED, Json(acknowledgement)).into_response(),
        Err(error) => {
            tracing::error!("Could not request the account balance: {error}");
            Error::from(error).into_response()
        }
    }
}
