//! Exact decimal amounts.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal;

use crate::error::Error;

/// An exact decimal amount of a stablecoin.
///
/// Wraps [`rust_decimal::Decimal`]; arithmetic is checked and textual
/// representations round-trip. Floating point never touches an `Amount`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    /// Zero.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Wraps a raw decimal.
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Parses a decimal string, rejecting anything unparseable.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Decimal::from_str(s)
            .map(Self)
            .map_err(|_| Error::Validation(format!("not a decimal amount: {s:?}")))
    }

    /// The wrapped decimal.
    pub const fn inner(&self) -> Decimal {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Checked subtraction.
    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Subtraction clamped at zero, for aggregate counters that must not
    /// go negative when released out of order.
    pub fn saturating_sub(&self, other: Self) -> Self {
        if other.0 >= self.0 { Self::ZERO } else { Self(self.0 - other.0) }
    }

    /// True for amounts strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// True for exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The amount in base units of a 6-decimal stablecoin, as the integer
    /// string on-chain calls expect. Fails for amounts with more than six
    /// fractional digits.
    pub fn to_base_units(&self) -> Result<String, Error> {
        let scaled = self
            .0
            .checked_mul(Decimal::from(1_000_000_u32))
            .ok_or_else(|| Error::Validation(format!("amount out of range: {self}")))?;
        if scaled.fract().is_zero() {
            Ok(scaled.trunc().to_string())
        } else {
            Err(Error::Validation(format!("amount has sub-micro precision: {self}")))
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parse_format_roundtrips() -> Result<(), Box<dyn std::error::Error>> {
        for text in ["0", "25.00", "0.000001", "123456789.123456789012345678"] {
            let amount = Amount::parse(text)?;
            assert_eq!(amount.to_string(), text);
        }
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(Amount::parse("ten dollars").is_err());
        assert!(Amount::parse("").is_err());
    }

    #[test]
    fn checked_arithmetic() -> Result<(), Box<dyn std::error::Error>> {
        let a = Amount::parse("10.50")?;
        let b = Amount::parse("0.25")?;
        assert_eq!(a.checked_add(b), Some(Amount::new(dec!(10.75))));
        assert_eq!(a.checked_sub(b), Some(Amount::new(dec!(10.25))));
        assert_eq!(b.saturating_sub(a), Amount::ZERO);
        Ok(())
    }

    #[test]
    fn base_units_for_six_decimals() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Amount::parse("25.5")?.to_base_units()?, "25500000");
        assert_eq!(Amount::parse("0.000001")?.to_base_units()?, "1");
        assert!(Amount::parse("0.0000001")?.to_base_units().is_err());
        Ok(())
    }

    #[test]
    fn serde_uses_strings() -> Result<(), Box<dyn std::error::Error>> {
        let amount = Amount::parse("42.42")?;
        assert_eq!(serde_json::to_string(&amount)?, "\"42.42\"");
        let back: Amount = serde_json::from_str("\"42.42\"")?;
        assert_eq!(back, amount);
        Ok(())
    }
}
