//! The seam between the payment workflow and the provider's API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Amount, PhoneNumber,
    mpesa::{AccountBalanceResponse, ProviderError},
    payment::PaymentRequest,
};

/// A request to prompt a customer to pay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// The phone that receives the payment prompt.
    pub phone_number: PhoneNumber,
    /// The amount to pay, in whole shillings.
    pub amount: Amount,
    /// The reference shown to the customer, e.g. an account name.
    pub account_reference: String,
    /// A short description of the payment.
    pub description: String,
}

/// The provider's acceptance of a [PushRequest].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAccepted {
    /// The provider's ID for the merchant side of the request.
    pub merchant_request_id: String,
    /// The provider's ID for the checkout, used to correlate the result.
    pub checkout_request_id: String,
    /// The message the provider suggests showing to the customer.
    pub customer_message: String,
}

/// The fields of a successful payment as reported by the provider.
///
/// Every field is optional because the provider omits fields in some
/// deliveries. A payment without an amount or receipt number cannot be
/// recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentDetails {
    /// The amount paid.
    pub amount: Option<Amount>,
    /// The provider's receipt number.
    pub receipt_number: Option<String>,
    /// The phone number that paid.
    pub phone_number: Option<PhoneNumber>,
    /// When the payment happened.
    pub transaction_date: Option<OffsetDateTime>,
}

/// The result of a payment request as reported by a callback or a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// The customer paid.
    Succeeded(PaymentDetails),
    /// The payment did not go through, e.g. the customer cancelled.
    Failed {
        /// The provider's result code.
        result_code: String,
        /// The provider's explanation.
        description: String,
    },
    /// The customer has not answered the prompt yet.
    Pending,
}

/// A mobile-money provider that can prompt customers to pay and report the
/// result.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Prompt the customer to pay.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the provider could not be reached or
    /// refused the request.
    async fn request_payment(&self, request: &PushRequest) -> Result<PushAccepted, ProviderError>;

    /// Ask the provider for the result of an earlier request.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the provider could not be reached or
    /// refused the query. A payment that is still in progress is
    /// [ProviderOutcome::Pending], not an error.
    async fn query_status(&self, request: &PaymentRequest)
    -> Result<ProviderOutcome, ProviderError>;

    /// Ask the provider to report the business account balance.
    ///
    /// The balance itself is delivered asynchronously to the configured
    /// result URL. Providers without a balance API refuse the request.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the provider could not be reached or
    /// refused the query.
    async fn request_account_balance(&self) -> Result<AccountBalanceResponse, ProviderError> {
        Err(ProviderError::Rejected {
            code: "unsupported".to_owned(),
            description: "this provider cannot report account balances".to_owned(),
        })
    }
}
