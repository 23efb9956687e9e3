//! Per-request credentials for STK push calls.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use time::{OffsetDateTime, UtcOffset};

use crate::timezone::format_compact_timestamp;

/// The timestamp and password pair that authenticates a single STK push or
/// status query.
///
/// The provider only accepts a password whose embedded timestamp is current,
/// so a credential must be generated for every call and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkCredential {
    /// The provider-local time of the call as `YYYYMMDDHHMMSS`.
    pub timestamp: String,
    /// `base64(short_code + passkey + timestamp)`.
    pub password: String,
}

impl StkCredential {
    /// Generate the credential for a call made at `now`.
    ///
    /// `provider_offset` is the provider's UTC offset (East Africa Time).
    pub fn generate(
        short_code: &str,
        passkey: &str,
        now: OffsetDateTime,
        provider_offset: UtcOffset,
    ) -> Self {
        let timestamp = format_compact_timestamp(now, provider_offset);
        let password = BASE64.encode(format!("{short_code}{passkey}{timestamp}"));

        Self {
            timestamp,
            password,
        }
    }
}
