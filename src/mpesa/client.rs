//! A REST client for the provider's API.

use std::{fmt::Debug, future::Future, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use time::{OffsetDateTime, UtcOffset};

use crate::{
    mpesa::{
        PaymentDetails, PaymentProvider, ProviderError, ProviderOutcome, PushAccepted, PushRequest,
        StkCredential,
        types::{
            AccessToken, AccountBalanceBody, AccountBalanceResponse, StkPushBody, StkPushResponse,
            StkQueryBody, StkQueryResponse,
        },
    },
    payment::PaymentRequest,
};

/// The sandbox base URL.
pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";

/// The result code a status query returns while the payment is in progress.
const QUERY_IN_PROGRESS_RESULT_CODE: &str = "4999";

/// Connection details and credentials for the provider.
#[derive(Clone)]
pub struct MpesaConfig {
    /// The API base URL, without a trailing slash.
    pub base_url: String,
    /// The OAuth consumer key.
    pub consumer_key: String,
    /// The OAuth consumer secret.
    pub consumer_secret: String,
    /// The business short code payments are made to.
    pub short_code: String,
    /// The passkey used to derive STK passwords.
    pub passkey: String,
    /// The public URL of the payment callback endpoint.
    pub callback_url: String,
    /// "CustomerPayBillOnline" or "CustomerBuyGoodsOnline".
    pub transaction_type: String,
    /// The API operator used for account balance queries.
    pub initiator_name: String,
    /// The encrypted initiator password used for account balance queries.
    pub security_credential: String,
    /// Where the provider sends account balance results.
    pub balance_result_url: String,
    /// Where the provider reports account balance queries that timed out.
    pub balance_timeout_url: String,
    /// The timeout of a single HTTP request.
    pub request_timeout: Duration,
    /// How many times a transient failure is retried.
    pub max_retries: u32,
    /// The first retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// The upper bound of a retry delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: SANDBOX_BASE_URL.to_owned(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            short_code: "174379".to_owned(),
            passkey: String::new(),
            callback_url: String::new(),
            transaction_type: "CustomerPayBillOnline".to_owned(),
            initiator_name: "testapi".to_owned(),
            security_credential: String::new(),
            balance_result_url: String::new(),
            balance_timeout_url: String::new(),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl Debug for MpesaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpesaConfig")
            .field("base_url", &self.base_url)
            .field("short_code", &self.short_code)
            .field("callback_url", &self.callback_url)
            .field("transaction_type", &self.transaction_type)
            .field("initiator_name", &self.initiator_name)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Calls the provider's OAuth, STK push, STK query and account balance APIs.
///
/// Every call fetches a fresh access token and, for STK calls, a fresh
/// [StkCredential]. Transient failures are retried with exponential backoff
/// and jitter.
#[derive(Debug, Clone)]
pub struct MpesaClient {
    http: Client,
    config: MpesaConfig,
    provider_offset: UtcOffset,
}

impl MpesaClient {
    /// Create a client.
    ///
    /// `provider_offset` is the provider's UTC offset, used for STK timestamps.
    ///
    /// # Errors
    /// Returns [ProviderError::Http] if the HTTP client could not be built.
    pub fn new(config: MpesaConfig, provider_offset: UtcOffset) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| ProviderError::Http(error.to_string()))?;

        Ok(Self {
            http,
            config,
            provider_offset,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn credential(&self) -> StkCredential {
        StkCredential::generate(
            &self.config.short_code,
            &self.config.passkey,
            OffsetDateTime::now_utc(),
            self.provider_offset,
        )
    }

    /// Fetch a new OAuth access token.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the token could not be fetched.
    pub async fn access_token(&self) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;

        let token: AccessToken = decode(response).await?;

        Ok(token.access_token)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        decode(response).await
    }

    /// Send an STK push prompting the customer to pay.
    ///
    /// A failed push is retried only when the provider cannot have received
    /// it. A push that timed out or hit a server error may already have
    /// prompted the customer, and a second push would prompt them again.
    ///
    /// # Errors
    /// Returns [ProviderError::Rejected] if the provider refused the request,
    /// or another [ProviderError] if it could not be reached.
    pub async fn stk_push(&self, request: &PushRequest) -> Result<PushAccepted, ProviderError> {
        self.with_retries(
            "stk_push",
            |error| error.is_transient() && !error.may_have_been_processed(),
            move || self.stk_push_once(request),
        )
        .await
    }

    async fn stk_push_once(&self, request: &PushRequest) -> Result<PushAccepted, ProviderError> {
        let credential = self.credential();
        let amount = request.amount.whole_shillings().ok_or_else(|| {
            ProviderError::Rejected {
                code: "amount".to_owned(),
                description: format!("{} is not a whole number of shillings", request.amount),
            }
        })?;
        let phone_number = request.phone_number.as_u64();

        let body = StkPushBody {
            business_short_code: &self.config.short_code,
            password: &credential.password,
            timestamp: &credential.timestamp,
            transaction_type: &self.config.transaction_type,
            amount,
            party_a: phone_number,
            party_b: &self.config.short_code,
            phone_number,
            callback_url: &self.config.callback_url,
            account_reference: &request.account_reference,
            transaction_desc: &request.description,
        };

        let response: StkPushResponse = self.post("/mpesa/stkpush/v1/processrequest", &body).await?;

        if response.response_code != "0" {
            return Err(ProviderError::Rejected {
                code: response.response_code,
                description: response.response_description,
            });
        }

        Ok(PushAccepted {
            merchant_request_id: response.merchant_request_id,
            checkout_request_id: response.checkout_request_id,
            customer_message: response.customer_message,
        })
    }

    /// Ask the provider for the result of an STK push.
    ///
    /// The status query does not report the receipt number, so a successful
    /// result carries the amount and phone number of `request` only.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the provider could not be reached or
    /// refused the query.
    pub async fn stk_query(&self, request: &PaymentRequest) -> Result<ProviderOutcome, ProviderError> {
        let result = self
            .with_retries("stk_query", is_retryable_query_error, move || {
                self.stk_query_once(&request.checkout_request_id)
            })
            .await;

        match result {
            Ok(response) => Ok(outcome_from_query(request, response)),
            Err(error) if error.is_still_processing() => Ok(ProviderOutcome::Pending),
            Err(error) => Err(error),
        }
    }

    async fn stk_query_once(
        &self,
        checkout_request_id: &str,
    ) -> Result<StkQueryResponse, ProviderError> {
        let credential = self.credential();

        let body = StkQueryBody {
            business_short_code: &self.config.short_code,
            password: &credential.password,
            timestamp: &credential.timestamp,
            checkout_request_id,
        };

        self.post("/mpesa/stkpushquery/v1/query", &body).await
    }

    /// Ask the provider to send the account balance to the configured result
    /// URL.
    ///
    /// # Errors
    /// Returns a [ProviderError] if the provider could not be reached or
    /// refused the query.
    pub async fn account_balance(&self) -> Result<AccountBalanceResponse, ProviderError> {
        let response: AccountBalanceResponse = self
            .with_retries("account_balance", is_retryable_query_error, move || {
                let body = AccountBalanceBody {
                    initiator: &self.config.initiator_name,
                    security_credential: &self.config.security_credential,
                    command_id: "AccountBalance",
                    party_a: &self.config.short_code,
                    identifier_type: "4",
                    remarks: "Balance query",
                    queue_timeout_url: &self.config.balance_timeout_url,
                    result_url: &self.config.balance_result_url,
                };

                async move { self.post("/mpesa/accountbalance/v1/query", &body).await }
            })
            .await?;

        if response.response_code != "0" {
            return Err(ProviderError::Rejected {
                code: response.response_code,
                description: response.response_description,
            });
        }

        Ok(response)
    }

    async fn with_retries<R, F, Fut, T>(
        &self,
        desc: &str,
        should_retry: R,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        R: Fn(&ProviderError) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !should_retry(&error) || attempt >= self.config.max_retries {
                        return Err(error);
                    }

                    let delay =
                        backoff_delay(attempt, self.config.base_delay_ms, self.config.max_delay_ms);

                    tracing::warn!(
                        desc,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        next_delay_ms = delay.as_millis() as u64,
                        "Retrying transient provider error: {error}"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for MpesaClient {
    async fn request_payment(&self, request: &PushRequest) -> Result<PushAccepted, ProviderError> {
        self.stk_push(request).await
    }

    async fn query_status(
        &self,
        request: &PaymentRequest,
    ) -> Result<ProviderOutcome, ProviderError> {
        self.stk_query(request).await
    }

    async fn request_account_balance(&self) -> Result<AccountBalanceResponse, ProviderError> {
        self.account_balance().await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        serde_json::from_str(&text).map_err(|error| ProviderError::Decode(error.to_string()))
    } else {
        Err(ProviderError::from_response(status, &text))
    }
}

/// Exponential backoff with jitter, capped at `max_delay_ms`.
fn backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let base = base_delay_ms.max(1);
    let exponential = base.saturating_mul(1u64 << attempt.min(20));
    let cap = exponential.min(max_delay_ms.max(base));

    let delay_ms = if cap > base {
        rand::thread_rng().gen_range(base..=cap)
    } else {
        base
    };

    Duration::from_millis(delay_ms)
}

fn is_retryable_query_error(error: &ProviderError) -> bool {
    error.is_transient() && !error.is_still_processing()
}

fn outcome_from_query(request: &PaymentRequest, response: StkQueryResponse) -> ProviderOutcome {
    match response.result_code.as_str() {
        "0" => ProviderOutcome::Succeeded(PaymentDetails {
            amount: Some(request.amount),
            receipt_number: None,
            phone_number: Some(request.phone_number.clone()),
            transaction_date: None,
        }),
        QUERY_IN_PROGRESS_RESULT_CODE => ProviderOutcome::Pending,
        _ => ProviderOutcome::Failed {
            result_code: response.result_code,
            description: response.result_desc,
        },
    }
}
