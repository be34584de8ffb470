//! Money Module
//!
//! Integer minor-unit representation of monetary amounts, plus strict
//! conversion from client-facing decimal strings / `Decimal` values.
//!
//! ## Internal Representation
//! - Every balance and amount is an [`Amount`]: a `u64` count of minor units
//!   (cents for a 2-decimal currency). Floating point never appears.
//! - The scale factor is `10^decimals`, taken from `ledger.currency_decimals`.
//! - Amounts are capped at [`MAX_AMOUNT`] (`i64::MAX`) so every store can
//!   persist them as a signed 64-bit column.
//!
//! ## Usage
//! ```rust
//! use wallet_ledger::money::{parse_amount, format_amount};
//!
//! let internal = parse_amount("12.50", 2).unwrap();
//! assert_eq!(*internal, 1250);
//! assert_eq!(format_amount(internal, 2), "12.50");
//! ```

use std::fmt;
use std::ops::Deref;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest amount any account may hold, in minor units
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Non-negative amount in integer minor units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(minor_units: u64) -> Self {
        Self(minor_units)
    }

    #[inline]
    pub const fn minor_units(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }
}

impl Deref for Amount {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Amount {
    type Error = MoneyError;

    /// Stores hand back signed columns; a negative value means corruption
    fn try_from(v: i64) -> Result<Self, Self::Error> {
        u64::try_from(v).map(Amount).map_err(|_| MoneyError::InvalidAmount)
    }
}

impl TryFrom<Amount> for i64 {
    type Error = MoneyError;

    fn try_from(v: Amount) -> Result<Self, Self::Error> {
        i64::try_from(v.0).map_err(|_| MoneyError::Overflow)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Parse: Client → Internal
// ============================================================================

/// Convert a client string amount ("12.50") to minor units
///
/// # Errors
/// * `PrecisionOverflow` - more fractional digits than `decimals` (no silent truncation)
/// * `InvalidAmount` - zero or signed input
/// * `Overflow` - larger than [`MAX_AMOUNT`]
/// * `InvalidFormat` - anything else that is not `digits[.digits]`
pub fn parse_amount(amount_str: &str, decimals: u32) -> Result<Amount, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let (whole, frac) = match amount_str.split_once('.') {
        None => (amount_str, ""),
        Some((whole, frac)) => {
            // "5." and ".5" are ambiguous; require both sides
            if whole.is_empty() || frac.is_empty() {
                return Err(MoneyError::InvalidFormat(format!(
                    "incomplete decimal: {}",
                    amount_str
                )));
            }
            if frac.contains('.') {
                return Err(MoneyError::InvalidFormat("multiple decimal points".into()));
            }
            if decimals == 0 {
                return Err(MoneyError::InvalidFormat(
                    "currency has no minor units, but dot provided".into(),
                ));
            }
            (whole, frac)
        }
    };

    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in {}",
            amount_str
        )));
    }

    if frac.len() > decimals as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: decimals,
        });
    }

    let whole_num: u64 = whole.parse().map_err(|_| MoneyError::Overflow)?;
    let frac_num: u64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<width$}", frac, width = decimals as usize)
            .parse()
            .map_err(|_| MoneyError::InvalidFormat("invalid fractional part".into()))?
    };

    let multiplier = 10u64.checked_pow(decimals).ok_or(MoneyError::Overflow)?;
    let amount = whole_num
        .checked_mul(multiplier)
        .and_then(|v| v.checked_add(frac_num))
        .filter(|v| *v <= MAX_AMOUNT)
        .ok_or(MoneyError::Overflow)?;

    if amount == 0 {
        return Err(MoneyError::InvalidAmount);
    }

    Ok(Amount(amount))
}

/// Convert a `Decimal` to minor units
///
/// Trailing zeros count toward the scale: `1.230` has three decimals and is
/// rejected for a 2-decimal currency, same as the string path.
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<Amount, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    if decimal.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimal.scale(),
            max: decimals,
        });
    }

    let multiplier = 10u64.checked_pow(decimals).ok_or(MoneyError::Overflow)?;
    let scaled = decimal
        .checked_mul(Decimal::from(multiplier))
        .ok_or(MoneyError::Overflow)?;

    scaled
        .to_u64()
        .filter(|v| *v <= MAX_AMOUNT)
        .map(Amount)
        .ok_or(MoneyError::Overflow)
}

// ============================================================================
// Format: Internal → Client
// ============================================================================

/// Render minor units with exactly `decimals` fractional digits
pub fn format_amount(value: Amount, decimals: u32) -> String {
    let decimal_value = Decimal::from(value.0) / Decimal::from(10u64.pow(decimals));
    format!("{:.prec$}", decimal_value, prec = decimals as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_amount_basic() {
        assert_eq!(parse_amount("12.50", 2).unwrap(), Amount(1250));
        assert_eq!(parse_amount("12.5", 2).unwrap(), Amount(1250));
        assert_eq!(parse_amount("100", 2).unwrap(), Amount(10000));
        assert_eq!(parse_amount("0.01", 2).unwrap(), Amount(1));
        assert_eq!(parse_amount("7", 0).unwrap(), Amount(7));
    }

    #[test]
    fn test_parse_amount_rejects_bad_input() {
        let cases = ["", "-1", "+1", ".5", "5.", "1.2.3", "abc", "1e3", "1,00"];
        for case in cases {
            assert!(parse_amount(case, 2).is_err(), "should reject {:?}", case);
        }
        assert!(matches!(parse_amount("0", 2), Err(MoneyError::InvalidAmount)));
        assert!(matches!(parse_amount("0.00", 2), Err(MoneyError::InvalidAmount)));
        assert!(parse_amount("1.0", 0).is_err());
    }

    #[test]
    fn test_parse_amount_precision_limit() {
        assert!(parse_amount("1.23", 2).is_ok());
        assert_eq!(
            parse_amount("1.234", 2),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_parse_amount_upper_bound() {
        // i64::MAX = 9_223_372_036_854_775_807
        assert_eq!(
            parse_amount("92233720368547758.07", 2).unwrap(),
            Amount(MAX_AMOUNT)
        );
        assert_eq!(
            parse_amount("92233720368547758.08", 2),
            Err(MoneyError::Overflow)
        );
        assert_eq!(
            parse_amount("99999999999999999999999", 0),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn test_parse_decimal() {
        let d = Decimal::from_str("1.23").unwrap();
        assert_eq!(parse_decimal(d, 2).unwrap(), Amount(123));

        // Scale counts trailing zeros
        let d = Decimal::from_str("1.230").unwrap();
        assert!(matches!(
            parse_decimal(d, 2),
            Err(MoneyError::PrecisionOverflow { provided: 3, max: 2 })
        ));

        assert_eq!(parse_decimal(Decimal::ZERO, 2), Err(MoneyError::InvalidAmount));
        assert_eq!(
            parse_decimal(Decimal::from_str("-1").unwrap(), 2),
            Err(MoneyError::InvalidAmount)
        );
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Amount(1250), 2), "12.50");
        assert_eq!(format_amount(Amount(1), 2), "0.01");
        assert_eq!(format_amount(Amount(0), 2), "0.00");
        assert_eq!(format_amount(Amount(42), 0), "42");
    }

    #[test]
    fn test_signed_conversions() {
        assert_eq!(Amount::try_from(5i64).unwrap(), Amount(5));
        assert!(Amount::try_from(-1i64).is_err());
        assert_eq!(i64::try_from(Amount(MAX_AMOUNT)).unwrap(), i64::MAX);
        assert!(i64::try_from(Amount(u64::MAX)).is_err());
    }
}
