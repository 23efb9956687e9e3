//! The STK push result callback body and its conversion into a
//! [ProviderOutcome].

use serde::Deserialize;
use serde_json::Value;
use time::UtcOffset;

use crate::{
    Amount, Error, PhoneNumber,
    mpesa::{PaymentDetails, ProviderOutcome, types::code_as_string},
    timezone::parse_compact_timestamp,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackEnvelope {
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: Option<String>,
    #[serde(deserialize_with = "code_as_string")]
    result_code: String,
    #[serde(default)]
    result_desc: String,
    #[serde(default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackMetadata {
    #[serde(default)]
    item: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataItem {
    name: String,
    #[serde(default)]
    value: Option<Value>,
}

impl CallbackMetadata {
    /// The value of the first item called `name`. Items without a value are
    /// skipped.
    fn get(&self, name: &str) -> Option<&Value> {
        self.item
            .iter()
            .filter(|item| item.name == name)
            .find_map(|item| item.value.as_ref())
    }
}

/// A callback with its correlation identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCallback {
    /// The provider's ID for the merchant side of the request.
    pub merchant_request_id: Option<String>,
    /// The checkout request the callback answers.
    pub checkout_request_id: Option<String>,
    /// What the callback reports.
    pub outcome: ProviderOutcome,
}

/// Parse a raw callback body.
///
/// Metadata items are looked up by name, so their order does not matter.
/// Optional fields that cannot be read (the phone number and transaction
/// date) are dropped with a warning rather than failing the whole callback.
/// `provider_offset` is the UTC offset the provider's timestamps are in.
///
/// # Errors
/// Returns [Error::MalformedCallback] if the body is not a callback.
pub fn parse_callback(body: &[u8], provider_offset: UtcOffset) -> Result<ParsedCallback, Error> {
    let envelope: CallbackEnvelope = serde_json::from_slice(body)
        .map_err(|error| Error::MalformedCallback(error.to_string()))?;
    let callback = envelope.body.stk_callback;

    let outcome = if callback.result_code == "0" {
        let metadata = callback.callback_metadata.unwrap_or_default();
        ProviderOutcome::Succeeded(extract_details(&metadata, provider_offset))
    } else {
        ProviderOutcome::Failed {
            result_code: callback.result_code,
            description: callback.result_desc,
        }
    };

    Ok(ParsedCallback {
        merchant_request_id: callback.merchant_request_id,
        checkout_request_id: callback.checkout_request_id,
        outcome,
    })
}

fn extract_details(metadata: &CallbackMetadata, provider_offset: UtcOffset) -> PaymentDetails {
    let amount = metadata.get("Amount").and_then(Amount::from_json);

    let receipt_number = metadata
        .get("MpesaReceiptNumber")
        .and_then(value_as_text)
        .filter(|receipt| !receipt.is_empty());

    let phone_number = metadata
        .get("PhoneNumber")
        .and_then(value_as_text)
        .and_then(|text| match PhoneNumber::normalize(&text) {
            Ok(phone_number) => Some(phone_number),
            Err(error) => {
                tracing::warn!("Ignoring callback phone number: {error}");
                None
            }
        });

    let transaction_date = metadata
        .get("TransactionDate")
        .and_then(value_as_text)
        .and_then(|text| match parse_compact_timestamp(&text, provider_offset) {
            Ok(date) => Some(date),
            Err(error) => {
                tracing::warn!("Ignoring callback transaction date: {error}");
                None
            }
        });

    PaymentDetails {
        amount,
        receipt_number,
        phone_number,
        transaction_date,
    }
}

/// Read a metadata value that may be sent as a string or a number.
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_owned()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
