//! Normalization of payer phone numbers into the provider's canonical form.

use std::fmt::Display;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::Error;

/// The country calling code for Kenya.
pub const COUNTRY_CODE: &str = "254";

/// A phone number in the canonical international form, e.g. "254712345678".
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize `raw` into the canonical `254XXXXXXXXX` form.
    ///
    /// Separators (spaces, dashes, dots, parentheses) and a leading '+' are
    /// stripped. Local numbers starting with '0' and bare 9 digit subscriber
    /// numbers are prefixed with the country code.
    ///
    /// # Errors
    /// Returns [Error::InvalidPhoneNumber] if the result is not 12 digits
    /// starting with the country code.
    pub fn normalize(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let mut digits = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                _ => return Err(Error::InvalidPhoneNumber(raw.to_owned())),
            }
        }

        let canonical = if let Some(local) = digits.strip_prefix('0') {
            format!("{COUNTRY_CODE}{local}")
        } else if digits.len() == 9 && (digits.starts_with('7') || digits.starts_with('1')) {
            format!("{COUNTRY_CODE}{digits}")
        } else {
            digits
        };

        if canonical.len() != 12 || !canonical.starts_with(COUNTRY_CODE) {
            return Err(Error::InvalidPhoneNumber(raw.to_owned()));
        }

        Ok(Self(canonical))
    }

    /// Wrap a value that is already known to be canonical, e.g. one read back
    /// from the database.
    pub fn new_unchecked(canonical: &str) -> Self {
        Self(canonical.to_owned())
    }

    /// The phone number as an integer, the form the provider expects in
    /// request bodies.
    pub fn as_u64(&self) -> u64 {
        // Canonical numbers are always 12 ASCII digits.
        self.0.parse().unwrap_or_default()
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ToSql for PhoneNumber {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for PhoneNumber {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(PhoneNumber)
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;

    use super::PhoneNumber;

    #[test]
    fn keeps_canonical_numbers() {
        let phone = PhoneNumber::normalize("254712345678").unwrap();

        assert_eq!(phone.as_ref(), "254712345678");
    }

    #[test]
    fn maps_local_prefix_to_country_code() {
        assert_eq!(
            PhoneNumber::normalize("0712345678").unwrap().as_ref(),
            "254712345678"
        );
        assert_eq!(
            PhoneNumber::normalize("0110345678").unwrap().as_ref(),
            "254110345678"
        );
    }

    #[test]
    fn strips_separators_and_plus() {
        assert_eq!(
            PhoneNumber::normalize("+254 712-345.678").unwrap().as_ref(),
            "254712345678"
        );
        assert_eq!(
            PhoneNumber::normalize("(0712) 345 678").unwrap().as_ref(),
            "254712345678"
        );
    }

    #[test]
    fn prefixes_bare_subscriber_numbers() {
        assert_eq!(
            PhoneNumber::normalize("712345678").unwrap().as_ref(),
            "254712345678"
        );
    }

    #[test]
    fn rejects_wrong_lengths_and_letters() {
        for raw in ["", "07123", "2547123456789", "0712abc678", "15551234567"] {
            assert_eq!(
                PhoneNumber::normalize(raw),
                Err(Error::InvalidPhoneNumber(raw.to_owned())),
                "expected {raw:?} to be rejected"
            );
        }
    }

    #[test]
    fn converts_to_integer() {
        let phone = PhoneNumber::normalize("0712345678").unwrap();

        assert_eq!(phone.as_u64(), 254_712_345_678);
    }
}
