//! Exact-decimal money.
//!
//! Amounts are `rust_decimal::Decimal` plus an ISO 4217 currency code. The
//! decimal serializes as a string (`{"value":"89.99","currency":"USD"}`), so
//! the canonical JSON form is stable across platforms and never a binary
//! float. Arithmetic between different currencies is an error, not a cast.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Money arithmetic errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },
}

/// A monetary amount: exact decimal value + ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Decimal value, serialized as its shortest round-trip string.
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,

    /// ISO 4217 code, e.g. "USD".
    pub currency: String,
}

impl Amount {
    /// Create an amount from a decimal value and currency code.
    pub fn new(value: Decimal, currency: impl Into<String>) -> Self {
        Self {
            value,
            currency: currency.into(),
        }
    }

    /// Zero in the given currency.
    pub fn zero(currency: impl Into<String>) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Minor-unit digits for the currency (2 for most, 0 for JPY/KRW).
    pub fn minor_units(&self) -> u32 {
        match self.currency.as_str() {
            "JPY" | "KRW" => 0,
            _ => 2,
        }
    }

    /// Sum two amounts, failing on currency mismatch.
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, MoneyError> {
        self.require_same_currency(other)?;
        Ok(Amount::new(self.value + other.value, self.currency.clone()))
    }

    /// Multiply by a unitless rate (e.g. a tax rate), rounding half-up to
    /// the currency's minor-unit precision.
    pub fn mul_rate_rounded(&self, rate: Decimal) -> Amount {
        let raw = self.value * rate;
        Amount::new(
            raw.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointAwayFromZero),
            self.currency.clone(),
        )
    }

    /// Scale by an integer quantity (line-item totals).
    pub fn mul_quantity(&self, quantity: u32) -> Amount {
        Amount::new(self.value * Decimal::from(quantity), self.currency.clone())
    }

    /// `self > other`, failing on currency mismatch.
    pub fn gt(&self, other: &Amount) -> Result<bool, MoneyError> {
        self.require_same_currency(other)?;
        Ok(self.value > other.value)
    }

    /// `self == other` including currency.
    pub fn eq_exact(&self, other: &Amount) -> bool {
        self.currency == other.currency && self.value == other.value
    }

    /// True if strictly positive.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    fn require_same_currency(&self, other: &Amount) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.currency, self.value)
    }
}

/// Parse an amount from a decimal string, for test fixtures and config.
pub fn amount(value: &str, currency: &str) -> Amount {
    Amount::new(value.parse().expect("invalid decimal literal"), currency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_value_as_string() {
        let a = amount("89.99", "USD");
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["value"], "89.99");
        assert_eq!(json["currency"], "USD");
    }

    #[test]
    fn test_roundtrip_preserves_value() {
        let a = amount("0.10", "USD");
        let json = serde_json::to_string(&a).unwrap();
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert!(a.eq_exact(&back));
    }

    #[test]
    fn test_add_same_currency() {
        let total = amount("79.99", "USD")
            .checked_add(&amount("6.40", "USD"))
            .unwrap()
            .checked_add(&amount("3.60", "USD"))
            .unwrap();
        assert!(total.eq_exact(&amount("89.99", "USD")));
    }

    #[test]
    fn test_add_currency_mismatch_fails() {
        let err = amount("10.00", "USD")
            .checked_add(&amount("10.00", "EUR"))
            .unwrap_err();
        assert_eq!(
            err,
            MoneyError::CurrencyMismatch {
                left: "USD".into(),
                right: "EUR".into()
            }
        );
    }

    #[test]
    fn test_compare_currency_mismatch_fails() {
        assert!(amount("1.00", "USD").gt(&amount("0.50", "JPY")).is_err());
    }

    #[test]
    fn test_tax_rounds_half_up() {
        // 79.99 * 0.0825 = 6.599175 -> 6.60
        let tax = amount("79.99", "USD").mul_rate_rounded("0.0825".parse().unwrap());
        assert!(tax.eq_exact(&amount("6.60", "USD")));

        // midpoint rounds away from zero: 10.00 * 0.0625 = 0.625 -> 0.63
        let tax = amount("10.00", "USD").mul_rate_rounded("0.0625".parse().unwrap());
        assert!(tax.eq_exact(&amount("0.63", "USD")));
    }

    #[test]
    fn test_zero_minor_unit_currency() {
        let tax = amount("1000", "JPY").mul_rate_rounded("0.10".parse().unwrap());
        assert!(tax.eq_exact(&amount("100", "JPY")));
    }

    #[test]
    fn test_quantity_scaling() {
        let line = amount("24.50", "USD").mul_quantity(3);
        assert!(line.eq_exact(&amount("73.50", "USD")));
    }
}
