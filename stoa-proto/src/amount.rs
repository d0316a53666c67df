//! Fixed-point USDC amounts.
//!
//! Prices and charges travel through the protocol as integer micro-USDC
//! (6 decimals, the token's native precision). On the wire an amount is a
//! stringified integer — `"50000"` for $0.05 — so no JSON number-precision
//! issues can corrupt a charge. [`rust_decimal`] is used only at the edges
//! to convert to and from human-readable dollar values.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of decimal places in USDC's native representation.
pub const USDC_DECIMALS: u32 = 6;

/// A non-negative USDC amount stored as integer micro-units.
///
/// # Serialization
///
/// Serialized as a stringified integer of micro-USDC:
///
/// ```json
/// "50000"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UsdcAmount(u64);

impl UsdcAmount {
    /// Zero USDC.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from raw micro-USDC units.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the amount in raw micro-USDC units.
    #[must_use]
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the amount is zero (a free call).
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Converts to a decimal dollar value (e.g., `0.05`), with trailing
    /// zeros stripped.
    #[must_use]
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0 as i64, USDC_DECIMALS).normalize()
    }

    /// Parses a human-readable dollar value (e.g., `"0.05"`) into micro-USDC.
    ///
    /// # Errors
    ///
    /// Returns [`AmountParseError`] if the input is not a non-negative
    /// decimal with at most six fractional digits.
    pub fn parse_usdc(value: &str) -> Result<Self, AmountParseError> {
        let decimal =
            Decimal::from_str(value.trim()).map_err(|_| AmountParseError::NotANumber)?;
        Self::from_decimal(decimal)
    }

    /// Converts a decimal dollar value into micro-USDC.
    ///
    /// # Errors
    ///
    /// Returns [`AmountParseError`] on negative values or precision beyond
    /// six decimal places.
    pub fn from_decimal(value: Decimal) -> Result<Self, AmountParseError> {
        if value.is_sign_negative() {
            return Err(AmountParseError::Negative);
        }
        let scaled = value
            .checked_mul(Decimal::from(1_000_000u32))
            .ok_or(AmountParseError::Overflow)?;
        if scaled.fract() != Decimal::ZERO {
            return Err(AmountParseError::TooPrecise);
        }
        let micros = scaled.trunc().to_u64().ok_or(AmountParseError::Overflow)?;
        Ok(Self(micros))
    }
}

/// Errors from parsing a human-readable USDC value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    /// The input could not be parsed as a decimal number.
    #[error("not a decimal number")]
    NotANumber,
    /// Negative amounts are not representable.
    #[error("amount must be non-negative")]
    Negative,
    /// More than six fractional digits.
    #[error("amount has sub-micro precision")]
    TooPrecise,
    /// The value exceeds the representable range.
    #[error("amount out of range")]
    Overflow,
}

impl fmt::Display for UsdcAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Serialize for UsdcAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UsdcAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let micros = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("amount must be a non-negative integer"))?;
        Ok(Self(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dollar_values() {
        assert_eq!(UsdcAmount::parse_usdc("0.05").unwrap().as_micros(), 50_000);
        assert_eq!(UsdcAmount::parse_usdc("1").unwrap().as_micros(), 1_000_000);
        assert_eq!(UsdcAmount::parse_usdc("0").unwrap(), UsdcAmount::ZERO);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            UsdcAmount::parse_usdc("-1"),
            Err(AmountParseError::Negative)
        );
        assert_eq!(
            UsdcAmount::parse_usdc("0.0000001"),
            Err(AmountParseError::TooPrecise)
        );
        assert_eq!(
            UsdcAmount::parse_usdc("lots"),
            Err(AmountParseError::NotANumber)
        );
    }

    #[test]
    fn wire_format_is_stringified_micros() {
        let amount = UsdcAmount::from_micros(50_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"50000\"");
        let back: UsdcAmount = serde_json::from_str("\"50000\"").unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn displays_as_dollars() {
        assert_eq!(UsdcAmount::from_micros(50_000).to_string(), "0.05");
    }
}
