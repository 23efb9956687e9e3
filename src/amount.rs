//! Money amounts stored as integer cents.
//!
//! Ledger totals are sums over sets of entries, so amounts are kept in minor
//! units to make those sums exact and independent of summation order.

use std::fmt::Display;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An amount of money in cents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero cents.
    pub const ZERO: Amount = Amount(0);

    /// The largest single payment accepted from the provider, ten million
    /// shillings. Anything above this is a corrupt value, not money.
    pub const MAX_PAYMENT: Amount = Amount(1_000_000_000);

    /// Create an amount from a number of cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Create an amount from a whole number of shillings.
    ///
    /// Saturates at the bounds of `i64` cents.
    pub fn from_shillings(shillings: i64) -> Self {
        Self(shillings.saturating_mul(100))
    }

    /// The amount in cents.
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// The amount in whole shillings if it has no fractional part.
    pub fn whole_shillings(&self) -> Option<i64> {
        if self.0 % 100 == 0 {
            Some(self.0 / 100)
        } else {
            None
        }
    }

    /// Parse an amount from a JSON value sent by the provider.
    ///
    /// The provider sends amounts as numbers (`500`, `1.00`) but some
    /// gateways forward them as strings, so numeric strings are accepted too.
    /// Returns `None` for negative, non-finite or non-numeric values and for
    /// values above [Amount::MAX_PAYMENT].
    pub fn from_json(value: &Value) -> Option<Self> {
        let major = match value {
            Value::Number(number) => number.as_f64()?,
            Value::String(text) => text.trim().parse::<f64>().ok()?,
            _ => return None,
        };

        if !major.is_finite() || major < 0.0 {
            return None;
        }

        let cents = (major * 100.0).round();
        if cents > Self::MAX_PAYMENT.0 as f64 {
            return None;
        }

        Some(Self(cents as i64))
    }

    /// `self + rhs`, or `None` if the result does not fit in `i64` cents.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// `self - rhs`, or `None` if the result does not fit in `i64` cents.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let cents = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", cents / 100, cents % 100)
    }
}

/// Saturates at the bounds of `i64` cents, use [Amount::checked_add] where
/// overflow must be detected.
impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_add(rhs.0))
    }
}

/// Saturates at the bounds of `i64` cents, use [Amount::checked_sub] where
/// overflow must be detected.
impl std::ops::Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl ToSql for Amount {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Amount {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Amount)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Amount;

    #[test]
    fn parses_integer_and_decimal_numbers() {
        assert_eq!(Amount::from_json(&json!(500)), Some(Amount::from_shillings(500)));
        assert_eq!(Amount::from_json(&json!(1.00)), Some(Amount::from_cents(100)));
        assert_eq!(Amount::from_json(&json!(12.349)), Some(Amount::from_cents(1235)));
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(Amount::from_json(&json!(" 42.50 ")), Some(Amount::from_cents(4250)));
    }

    #[test]
    fn rejects_negative_and_non_numeric_values() {
        assert_eq!(Amount::from_json(&json!(-1)), None);
        assert_eq!(Amount::from_json(&json!("abc")), None);
        assert_eq!(Amount::from_json(&json!(null)), None);
        assert_eq!(Amount::from_json(&json!([500])), None);
    }

    #[test]
    fn rejects_values_above_the_payment_limit() {
        assert_eq!(Amount::from_json(&json!(1e300)), None);
        assert_eq!(Amount::from_json(&json!("92233720368547758.07")), None);
        assert_eq!(Amount::from_json(&json!(10_000_001)), None);
        assert_eq!(
            Amount::from_json(&json!(10_000_000)),
            Some(Amount::MAX_PAYMENT)
        );
    }

    #[test]
    fn arithmetic_does_not_overflow() {
        let max = Amount::from_cents(i64::MAX);
        let min = Amount::from_cents(i64::MIN);

        assert_eq!(max.checked_add(Amount::from_cents(1)), None);
        assert_eq!(min.checked_sub(Amount::from_cents(1)), None);
        assert_eq!(
            Amount::from_cents(150).checked_add(Amount::from_cents(50)),
            Some(Amount::from_cents(200))
        );
        assert_eq!(max + Amount::from_cents(1), max);
        assert_eq!(min - Amount::from_cents(1), min);
        assert_eq!(Amount::from_shillings(i64::MAX), max);
    }

    #[test]
    fn displays_with_two_decimal_places() {
        assert_eq!(Amount::from_cents(50_005).to_string(), "500.05");
        assert_eq!(Amount::from_cents(-250).to_string(), "-2.50");
    }

    #[test]
    fn whole_shillings_requires_no_fraction() {
        assert_eq!(Amount::from_shillings(7).whole_shillings(), Some(7));
        assert_eq!(Amount::from_cents(701).whole_shillings(), None);
    }
}
