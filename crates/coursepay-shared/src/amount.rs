//! Exact-integer token amounts.
//!
//! A [`TokenAmount`] is a `u128` count of the token's smallest unit
//! (e.g. 1 USDC = `1_000_000` at 6 decimals).  Amounts cross the wire and
//! the database as plain decimal strings so no precision is ever lost to
//! floating point or JSON number coercion.

use serde::{Deserialize, Serialize};

use crate::error::AmountError;

/// u128 holds 38 full decimal digits.
const MAX_DECIMALS: u8 = 38;

/// An exact token amount in smallest units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    pub fn base_units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse an exact decimal digit string ("100000000").
    pub fn parse(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Parse(s.to_string()));
        }
        s.parse::<u128>()
            .map(Self)
            .map_err(|_| AmountError::Overflow)
    }

    /// Convert a USD price to token base units at a given token/USD price.
    ///
    /// The quotient is formatted with two digits of surplus precision and
    /// then truncated at the token's decimal count, so the buyer is never
    /// charged a rounded-up base unit.  Floats stop here; everything
    /// downstream is integer arithmetic.
    pub fn from_usd(usd: f64, token_usd: f64, decimals: u8) -> Result<Self, AmountError> {
        if decimals > MAX_DECIMALS {
            return Err(AmountError::DecimalsOutOfRange(decimals));
        }
        if !usd.is_finite() || usd < 0.0 {
            return Err(AmountError::InvalidQuote(format!("usd price {usd}")));
        }
        if !token_usd.is_finite() || token_usd <= 0.0 {
            return Err(AmountError::InvalidQuote(format!(
                "token usd price {token_usd}"
            )));
        }

        let raw = usd / token_usd;
        if !raw.is_finite() {
            return Err(AmountError::Overflow);
        }

        // Format with surplus precision, then truncate the fraction at
        // `decimals` digits.  The final digit of a fixed-width format is
        // rounded, which is why the surplus digits exist: they absorb the
        // rounding so the kept digits are a pure truncation.
        let surplus = decimals as usize + 2;
        let formatted = format!("{raw:.surplus$}");
        let (int_part, frac_part) = formatted
            .split_once('.')
            .unwrap_or((formatted.as_str(), ""));

        let mut digits = String::with_capacity(int_part.len() + decimals as usize);
        digits.push_str(int_part);
        let keep = (decimals as usize).min(frac_part.len());
        digits.push_str(&frac_part[..keep]);
        for _ in keep..decimals as usize {
            digits.push('0');
        }

        digits
            .parse::<u128>()
            .map(Self)
            .map_err(|_| AmountError::Overflow)
    }

    pub fn checked_add(&self, other: TokenAmount) -> Result<TokenAmount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(TokenAmount)
            .ok_or(AmountError::Overflow)
    }

    pub fn checked_sub(&self, other: TokenAmount) -> Result<TokenAmount, AmountError> {
        self.0
            .checked_sub(other.0)
            .map(TokenAmount)
            .ok_or(AmountError::Overflow)
    }

    /// Render as a human-readable decimal at the token's precision
    /// ("100.000000" for 100_000000 at 6 decimals).
    pub fn to_decimal_string(&self, decimals: u8) -> String {
        if decimals == 0 {
            return self.0.to_string();
        }
        let divisor = 10u128.pow(decimals as u32);
        let whole = self.0 / divisor;
        let frac = self.0 % divisor;
        format!("{whole}.{frac:0>width$}", width = decimals as usize)
    }
}

impl std::fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TokenAmount::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let a = TokenAmount::parse("100000000").unwrap();
        assert_eq!(a.base_units(), 100_000_000);
        assert_eq!(a.to_string(), "100000000");
    }

    #[test]
    fn parse_rejects_non_digits() {
        assert!(TokenAmount::parse("100.5").is_err());
        assert!(TokenAmount::parse("-1").is_err());
        assert!(TokenAmount::parse("").is_err());
        assert!(TokenAmount::parse("1e6").is_err());
    }

    #[test]
    fn usd_conversion_stablecoin() {
        // $100 at $1.00/token, 6 decimals -> 100_000000 base units.
        let a = TokenAmount::from_usd(100.0, 1.0, 6).unwrap();
        assert_eq!(a.base_units(), 100_000_000);
    }

    #[test]
    fn usd_conversion_truncates_never_rounds_up() {
        // $1 at $3/token = 0.333... -> 0.333333 at 6 decimals, truncated.
        let a = TokenAmount::from_usd(1.0, 3.0, 6).unwrap();
        assert_eq!(a.base_units(), 333_333);

        // 2/3 = 0.666666... must not round to 0.666667.
        let b = TokenAmount::from_usd(2.0, 3.0, 6).unwrap();
        assert_eq!(b.base_units(), 666_666);
    }

    #[test]
    fn usd_conversion_zero_decimals() {
        let a = TokenAmount::from_usd(99.9, 1.0, 0).unwrap();
        assert_eq!(a.base_units(), 99);
    }

    #[test]
    fn usd_conversion_rejects_bad_quotes() {
        assert!(TokenAmount::from_usd(100.0, 0.0, 6).is_err());
        assert!(TokenAmount::from_usd(100.0, -1.0, 6).is_err());
        assert!(TokenAmount::from_usd(f64::NAN, 1.0, 6).is_err());
        assert!(TokenAmount::from_usd(100.0, f64::INFINITY, 6).is_err());
    }

    #[test]
    fn decimal_string_display() {
        let a = TokenAmount::from_base_units(100_000_000);
        assert_eq!(a.to_decimal_string(6), "100.000000");
        let b = TokenAmount::from_base_units(1);
        assert_eq!(b.to_decimal_string(6), "0.000001");
        assert_eq!(b.to_decimal_string(0), "1");
    }

    #[test]
    fn checked_math() {
        let a = TokenAmount::from_base_units(u128::MAX);
        assert!(a.checked_add(TokenAmount::from_base_units(1)).is_err());
        assert!(TokenAmount::ZERO
            .checked_sub(TokenAmount::from_base_units(1))
            .is_err());
    }
}
