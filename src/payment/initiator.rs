//! Starts STK push payments.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{
    Amount, Error, PhoneNumber, RateLimiter,
    database_id::CategoryId,
    mpesa::{PaymentProvider, PushRequest},
    payment::request::{NewPaymentRequest, PaymentRequest, insert_payment_request},
};

/// The provider truncates account references longer than this.
const MAX_ACCOUNT_REFERENCE_LENGTH: usize = 12;
/// The provider truncates descriptions longer than this.
const MAX_DESCRIPTION_LENGTH: usize = 13;
const DEFAULT_ACCOUNT_REFERENCE: &str = "Payment";

/// A request to start a payment, as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct InitiatePayment {
    /// The payer's phone number in any common Kenyan format.
    pub phone_number: String,
    /// The amount to request, must be a positive whole number of shillings.
    pub amount: Amount,
    /// The reference shown to the customer.
    pub account_reference: Option<String>,
    /// A short description of the payment.
    pub description: Option<String>,
    /// The category the payment should be recorded under.
    pub category_id: Option<CategoryId>,
}

/// Sends STK push requests and stores them for correlation with their
/// results.
///
/// The initiator never writes to the ledger, money is only recorded once the
/// provider reports that the customer paid.
#[derive(Clone)]
pub struct PaymentInitiator {
    db_connection: Arc<Mutex<Connection>>,
    provider: Arc<dyn PaymentProvider>,
    rate_limiter: Arc<RateLimiter>,
}

impl PaymentInitiator {
    /// Create an initiator.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        provider: Arc<dyn PaymentProvider>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            db_connection,
            provider,
            rate_limiter,
        }
    }

    /// Prompt the payer to pay and store the accepted request.
    ///
    /// # Errors
    /// Returns:
    /// - [Error::InvalidPhoneNumber] if the phone number cannot be normalized,
    /// - [Error::InvalidAmount] if the amount is not a positive whole number of
    ///   shillings,
    /// - [Error::RateLimited] if the phone number has made too many requests,
    /// - [Error::TransientProvider] if the provider could not be reached, the
    ///   caller may retry,
    /// - [Error::ProviderRejected] if the provider refused the request,
    /// - or a database error if the accepted request could not be stored.
    pub async fn initiate(&self, payment: InitiatePayment) -> Result<PaymentRequest, Error> {
        let phone_number = PhoneNumber::normalize(&payment.phone_number)?;

        match payment.amount.whole_shillings() {
            Some(shillings) if shillings > 0 => {}
            _ => {
                return Err(Error::InvalidAmount(format!(
                    "{} is not a positive whole number of shillings",
                    payment.amount
                )));
            }
        }

        self.rate_limiter.check(phone_number.as_ref(), Instant::now())?;

        let account_reference = truncate(
            payment
                .account_reference
                .as_deref()
                .map(str::trim)
                .filter(|reference| !reference.is_empty())
                .unwrap_or(DEFAULT_ACCOUNT_REFERENCE),
            MAX_ACCOUNT_REFERENCE_LENGTH,
        );
        let description = truncate(
            payment
                .description
                .as_deref()
                .map(str::trim)
                .filter(|description| !description.is_empty())
                .unwrap_or(&account_reference),
            MAX_DESCRIPTION_LENGTH,
        );

        let push = PushRequest {
            phone_number: phone_number.clone(),
            amount: payment.amount,
            account_reference: account_reference.clone(),
            description,
        };

        let accepted = self.provider.request_payment(&push).await.map_err(|error| {
            tracing::error!(phone_number = %phone_number, "Could not send STK push: {error}");
            Error::from(error)
        })?;

        let connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        let request = insert_payment_request(
            NewPaymentRequest {
                merchant_request_id: accepted.merchant_request_id,
                checkout_request_id: accepted.checkout_request_id,
                phone_number,
                amount: payment.amount,
                account_reference,
                category_id: payment.category_id,
            },
            OffsetDateTime::now_utc(),
            &connection,
        )?;

        tracing::info!(
            checkout_request_id = %request.checkout_request_id,
            amount = %request.amount,
            "Sent STK push"
        );

        Ok(request)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use rusqlite::Connection;

    use crate::{
        Amount, Error, PhoneNumber, RateLimiter,
        db::initialize,
        ledger::count_entries,
        mpesa::{ProviderError, fake::FakeProvider},
        payment::{PaymentState, request::get_payment_request},
    };

    use super::{InitiatePayment, PaymentInitiator};

    fn setup(max_requests: usize) -> (Arc<Mutex<Connection>>, Arc<FakeProvider>, PaymentInitiator) {
        let connection = Connection::open_in_memory().unwrap();
        initialize(&connection).unwrap();
        let connection = Arc::new(Mutex::new(connection));
        let provider = Arc::new(FakeProvider::new());
        let initiator = PaymentInitiator::new(
            connection.clone(),
            provider.clone(),
            Arc::new(RateLimiter::new(max_requests, Duration::from_secs(60))),
        );

        (connection, provider, initiator)
    }

    fn payment(phone_number: &str, amount: Amount) -> InitiatePayment {
        InitiatePayment {
            phone_number: phone_number.to_owned(),
            amount,
            account_reference: Some("Groceries for the week".to_owned()),
            description: None,
            category_id: None,
        }
    }

    #[tokio::test]
    async fn stores_requested_payment() {
        let (connection, provider, initiator) = setup(5);

        let request = initiator
            .initiate(payment("0712 345 678", Amount::from_shillings(500)))
            .await
            .unwrap();

        assert_eq!(request.state, PaymentState::Requested);
        assert_eq!(request.phone_number, PhoneNumber::new_unchecked("254712345678"));
        assert_eq!(request.account_reference, "Groceries fo");
        let pushes = provider.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].phone_number.as_ref(), "254712345678");
        assert_eq!(pushes[0].description, "Groceries fo");

        let connection = connection.lock().unwrap();
        assert_eq!(
            get_payment_request(&request.checkout_request_id, &connection),
            Ok(request)
        );
        assert_eq!(count_entries(&connection), Ok(0));
    }

    #[tokio::test]
    async fn rejects_invalid_phone_number() {
        let (_, provider, initiator) = setup(5);

        let result = initiator
            .initiate(payment("not a phone", Amount::from_shillings(500)))
            .await;

        assert!(matches!(result, Err(Error::InvalidPhoneNumber(_))));
        assert!(provider.pushes().is_empty());
    }

    #[tokio::test]
    async fn rejects_fractional_and_non_positive_amounts() {
        let (_, provider, initiator) = setup(5);

        for amount in [Amount::from_cents(50_050), Amount::ZERO] {
            let result = initiator.initiate(payment("0712345678", amount)).await;

            assert!(
                matches!(result, Err(Error::InvalidAmount(_))),
                "want {amount} to be rejected, got {result:?}"
            );
        }
        assert!(provider.pushes().is_empty());
    }

    #[tokio::test]
    async fn rate_limits_by_normalized_phone_number() {
        let (_, _, initiator) = setup(1);

        initiator
            .initiate(payment("0712345678", Amount::from_shillings(1)))
            .await
            .unwrap();
        let result = initiator
            .initiate(payment("+254 712 345 678", Amount::from_shillings(1)))
            .await;

        assert_eq!(result, Err(Error::RateLimited));
    }

    #[tokio::test]
    async fn transient_provider_failure_is_retryable() {
        let (connection, provider, initiator) = setup(5);
        provider.fail_pushes_with(ProviderError::Http("connection reset".to_owned()));

        let result = initiator
            .initiate(payment("0712345678", Amount::from_shillings(1)))
            .await;

        let error = result.expect_err("want the push to fail");
        assert!(matches!(error, Error::TransientProvider(_)));
        assert!(error.is_retryable());
        let count: i64 = connection
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM payment_request", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
