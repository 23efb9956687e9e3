//! Request and response bodies of the provider's REST API.

use serde::{Deserialize, Deserializer, Serialize};

/// The response of the OAuth token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    /// The bearer token.
    pub access_token: String,
    /// Seconds until the token expires, sent as a string.
    #[serde(default)]
    pub expires_in: Option<String>,
}

/// The body of an STK push request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushBody<'a> {
    pub business_short_code: &'a str,
    pub password: &'a str,
    pub timestamp: &'a str,
    pub transaction_type: &'a str,
    /// Whole shillings, the provider rejects fractional amounts.
    pub amount: i64,
    /// The phone number that pays.
    pub party_a: u64,
    /// The short code that receives the payment.
    pub party_b: &'a str,
    /// The phone number that is prompted to pay.
    pub phone_number: u64,
    #[serde(rename = "CallBackURL")]
    pub callback_url: &'a str,
    pub account_reference: &'a str,
    pub transaction_desc: &'a str,
}

/// The provider's synchronous answer to an STK push request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    pub response_code: String,
    #[serde(default)]
    pub response_description: String,
    #[serde(default)]
    pub customer_message: String,
}

/// The body of an STK push status query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkQueryBody<'a> {
    pub business_short_code: &'a str,
    pub password: &'a str,
    pub timestamp: &'a str,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: &'a str,
}

/// The provider's answer to a status query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkQueryResponse {
    pub response_code: String,
    #[serde(default)]
    pub response_description: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    /// "0" on success, the failure reason otherwise. Sent as a number or a
    /// string depending on the API version.
    #[serde(deserialize_with = "code_as_string")]
    pub result_code: String,
    #[serde(default)]
    pub result_desc: String,
}

/// The body of an account balance query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountBalanceBody<'a> {
    pub initiator: &'a str,
    pub security_credential: &'a str,
    #[serde(rename = "CommandID")]
    pub command_id: &'a str,
    pub party_a: &'a str,
    pub identifier_type: &'a str,
    pub remarks: &'a str,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_timeout_url: &'a str,
    #[serde(rename = "ResultURL")]
    pub result_url: &'a str,
}

/// The provider's acknowledgement of an account balance query. The balance
/// itself is delivered to the result URL later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountBalanceResponse {
    /// The ID the provider assigned to the query on receipt.
    #[serde(rename = "OriginatorConversationID", default)]
    pub originator_conversation_id: String,
    /// The ID the balance result will be delivered with.
    #[serde(rename = "ConversationID", default)]
    pub conversation_id: String,
    /// "0" if the query was accepted.
    pub response_code: String,
    /// The provider's explanation of the response code.
    #[serde(default)]
    pub response_description: String,
}

/// Accept a code sent as either a JSON number or a JSON string.
pub(crate) fn code_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Number(i64),
        Text(String),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Number(number) => number.to_string(),
        Code::Text(text) => text.trim().to_owned(),
    })
}
