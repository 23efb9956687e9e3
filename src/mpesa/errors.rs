//! Errors returned by calls to the provider.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::Error;

/// The error code the status query returns while the customer has not yet
/// answered the payment prompt.
pub const STILL_PROCESSING_ERROR_CODE: &str = "500.001.1001";

/// An error from a call to the provider's API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// No connection to the provider could be made, so nothing was sent.
    #[error("could not connect: {0}")]
    Connect(String),

    /// The request failed after it may have been sent, e.g. it timed out or
    /// the response could not be read.
    #[error("http error: {0}")]
    Http(String),

    /// The response body was not in the expected format.
    #[error("could not decode provider response: {0}")]
    Decode(String),

    /// The provider responded with a non-success HTTP status.
    #[error("provider responded with {status}: {code:?} {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The provider's error code, e.g. "500.001.1001".
        code: Option<String>,
        /// The provider's error message.
        message: String,
    },

    /// The provider accepted the HTTP request but refused the operation.
    #[error("provider refused the request: {code} {description}")]
    Rejected {
        /// The provider's response code.
        code: String,
        /// The provider's explanation.
        description: String,
    },
}

impl ProviderError {
    /// Whether the call may succeed if retried.
    ///
    /// Network errors, server errors, rate limiting and expired credentials
    /// are transient. Everything else needs a different request.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Connect(_) | ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => {
                let status = *status;
                (500..600).contains(&status)
                    || status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || status == StatusCode::UNAUTHORIZED.as_u16()
            }
            ProviderError::Decode(_) | ProviderError::Rejected { .. } => false,
        }
    }

    /// Whether the provider may have acted on the request even though the call
    /// failed.
    ///
    /// Connection failures, rate limiting and rejected credentials happen
    /// before the provider does anything. Timeouts and server errors do not
    /// say whether it did.
    pub fn may_have_been_processed(&self) -> bool {
        match self {
            ProviderError::Connect(_) | ProviderError::Rejected { .. } => false,
            ProviderError::Http(_) | ProviderError::Decode(_) => true,
            ProviderError::Api { status, .. } => {
                let status = *status;
                status != StatusCode::TOO_MANY_REQUESTS.as_u16()
                    && status != StatusCode::UNAUTHORIZED.as_u16()
            }
        }
    }

    /// Whether this is the status query's "still processing" answer.
    pub fn is_still_processing(&self) -> bool {
        matches!(
            self,
            ProviderError::Api { code: Some(code), .. } if code == STILL_PROCESSING_ERROR_CODE
        )
    }

    /// Build an error from a non-success response body.
    pub(crate) fn from_response(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => ProviderError::Api {
                status: status.as_u16(),
                code: envelope.error_code,
                message: envelope.error_message.unwrap_or_default(),
            },
            Err(_) => ProviderError::Api {
                status: status.as_u16(),
                code: None,
                message: body.chars().take(200).collect(),
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            ProviderError::Decode(value.to_string())
        } else if value.is_connect() {
            ProviderError::Connect(value.to_string())
        } else {
            ProviderError::Http(value.to_string())
        }
    }
}

impl From<ProviderError> for Error {
    fn from(value: ProviderError) -> Self {
        if value.is_transient() {
            Error::TransientProvider(value.to_string())
        } else {
            Error::ProviderRejected(value.to_string())
        }
    }
}

/// The error body the provider returns with non-success HTTP statuses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    error_code: Option<String>,
    error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::Error;

    use super::ProviderError;

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 429, 401] {
            let error = ProviderError::Api {
                status,
                code: None,
                message: String::new(),
            };

            assert!(error.is_transient(), "want {status} to be transient");
        }
    }

    #[test]
    fn client_errors_are_not_transient() {
        let error = ProviderError::Api {
            status: 400,
            code: Some("400.002.02".to_owned()),
            message: "Bad Request - Invalid PhoneNumber".to_owned(),
        };

        assert!(!error.is_transient());
        assert!(matches!(Error::from(error), Error::ProviderRejected(_)));
    }

    #[test]
    fn only_unsent_requests_are_known_to_be_unprocessed() {
        let unprocessed = [
            ProviderError::Connect("connection refused".to_owned()),
            ProviderError::Api {
                status: 429,
                code: None,
                message: String::new(),
            },
            ProviderError::Api {
                status: 401,
                code: None,
                message: String::new(),
            },
        ];
        let maybe_processed = [
            ProviderError::Http("operation timed out".to_owned()),
            ProviderError::Api {
                status: 503,
                code: None,
                message: String::new(),
            },
        ];

        for error in unprocessed {
            assert!(!error.may_have_been_processed(), "{error}");
        }
        for error in maybe_processed {
            assert!(error.may_have_been_processed(), "{error}");
        }
    }

    #[test]
    fn parses_still_processing_body() {
        let body = r#"{"requestId":"1234-5678","errorCode":"500.001.1001","errorMessage":"The transaction is being processed"}"#;

        let error = ProviderError::from_response(StatusCode::INTERNAL_SERVER_ERROR, body);

        assert!(error.is_still_processing());
        assert_eq!(
            error,
            ProviderError::Api {
                status: 500,
                code: Some("500.001.1001".to_owned()),
                message: "The transaction is being processed".to_owned(),
            }
        );
    }

    #[test]
    fn unparseable_error_body_keeps_status() {
        let error = ProviderError::from_response(StatusCode::BAD_GATEWAY, "<html>oops</html>");

        assert!(error.is_transient());
        assert!(!error.is_still_processing());
    }
}
