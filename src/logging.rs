//! Middleware for logging requests and responses.

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::{callback::acknowledgement, endpoints};

/// Request and response bodies larger than this many bytes are rejected.
///
/// Matches the default body limit axum applies to extractors.
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Bodies longer than this many characters are truncated in `info` logs.
pub const LOG_BODY_LENGTH_LIMIT: usize = 64;

/// JSON object keys whose values are phone numbers.
const PHONE_NUMBER_KEYS: [&str; 4] = ["phone_number", "PhoneNumber", "PartyA", "PartyB"];

/// Log the request and response for each request.
///
/// Both the request and response are logged at the `info` level.
/// If a body is longer than [LOG_BODY_LENGTH_LIMIT] characters, it is
/// truncated and logged in full at the `debug` level. Phone numbers in JSON
/// bodies are masked.
///
/// A request body that cannot be read within [MAX_BODY_SIZE] is rejected with
/// `400 Bad Request`, except on the callback route, which is always
/// acknowledged.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(error) if parts.uri.path() == endpoints::CALLBACK => {
            tracing::error!(
                "Could not read callback body, acknowledging without settling: {error}"
            );
            return acknowledgement();
        }
        Err(error) => {
            tracing::error!("Could not read request body: {error}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    log_body("Received request", &format!("{parts:#?}"), &body);

    let request = Request::from_parts(parts, Body::from(body));
    let response = next.run(request).await;

    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(error) => {
            tracing::error!("Could not read response body: {error}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    log_body("Sending response", &format!("{parts:#?}"), &body);

    Response::from_parts(parts, Body::from(body))
}

fn log_body(message: &str, headers: &str, body: &Bytes) {
    let text = redacted_text(body);

    if text.chars().count() > LOG_BODY_LENGTH_LIMIT {
        let truncated: String = text.chars().take(LOG_BODY_LENGTH_LIMIT).collect();
        tracing::info!("{message}: {headers}\nbody: {truncated}...");
        tracing::debug!("Full body: {text:?}");
    } else {
        tracing::info!("{message}: {headers}\nbody: {text:?}");
    }
}

/// The body as text with any phone numbers masked.
fn redacted_text(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(mut json) => {
            redact_phone_numbers(&mut json);
            json.to_string()
        }
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// Mask phone numbers in `value`, both plain fields and the provider's
/// `{"Name": "PhoneNumber", "Value": ...}` metadata items.
fn redact_phone_numbers(value: &mut Value) {
    match value {
        Value::Object(object) => {
            let is_phone_item = object.get("Name").and_then(Value::as_str) == Some("PhoneNumber");

            for (key, field) in object.iter_mut() {
                if PHONE_NUMBER_KEYS.contains(&key.as_str()) || (is_phone_item && key == "Value") {
                    *field = Value::String(mask(field));
                } else {
                    redact_phone_numbers(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_phone_numbers),
        _ => {}
    }
}

/// Keep the last three digits.
fn mask(value: &Value) -> String {
    let digits = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let keep = digits.chars().count().saturating_sub(3);

    digits
        .chars()
        .enumerate()
        .map(|(i, c)| if i < keep { '*' } else { c })
        .collect()
}
