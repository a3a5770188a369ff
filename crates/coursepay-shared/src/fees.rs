//! Basis-point fee splitting.
//!
//! All splits are floor division over base units, with the instructor
//! share defined as the remainder so the parts always sum exactly to the
//! total.  Fee percentages are captured on the purchase at creation time
//! and never recomputed from (possibly changed) settings afterwards.

use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;
use crate::constants::BPS_DENOMINATOR;
use crate::error::AmountError;

/// A fee rate in basis points, bounded to 0..=10000.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FeeBps(u16);

impl FeeBps {
    pub const ZERO: FeeBps = FeeBps(0);

    pub fn new(bps: u16) -> Result<Self, AmountError> {
        if u32::from(bps) > BPS_DENOMINATOR {
            return Err(AmountError::Parse(format!("fee bps out of range: {bps}")));
        }
        Ok(Self(bps))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

/// The fee rates actually applied to a purchase: the instructor's custom
/// override when active, else the platform defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EffectiveFees {
    pub platform_bps: FeeBps,
    pub revenue_split_bps: FeeBps,
    /// True when an active instructor override supplied these rates.
    pub custom: bool,
}

impl EffectiveFees {
    /// Instructor share in bps (complement of the platform fee).
    pub fn instructor_bps(&self) -> u16 {
        BPS_DENOMINATOR as u16 - self.platform_bps.value()
    }
}

/// An amount split into its platform / instructor / revenue-share parts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub total: TokenAmount,
    pub platform_fee: TokenAmount,
    pub instructor_fee: TokenAmount,
    /// Carved out of `platform_fee`, not additional to it.
    pub revenue_split: TokenAmount,
}

/// floor(amount * bps / 10000) without u128 overflow: split the amount
/// into quotient and remainder by the denominator first.
fn bps_of(amount: u128, bps: u16) -> u128 {
    let d = BPS_DENOMINATOR as u128;
    let b = bps as u128;
    (amount / d) * b + (amount % d) * b / d
}

/// Split a token amount by the effective fee rates.
///
/// Guarantees `platform_fee + instructor_fee == total` exactly: the
/// platform fee is floored and the instructor share is the remainder, so
/// rounding never leaks base units.
pub fn split_amount(total: TokenAmount, fees: &EffectiveFees) -> FeeBreakdown {
    let platform = bps_of(total.base_units(), fees.platform_bps.value());
    let instructor = total.base_units() - platform;
    let revenue_split = bps_of(platform, fees.revenue_split_bps.value());

    FeeBreakdown {
        total,
        platform_fee: TokenAmount::from_base_units(platform),
        instructor_fee: TokenAmount::from_base_units(instructor),
        revenue_split: TokenAmount::from_base_units(revenue_split),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fees(platform: u16, split: u16) -> EffectiveFees {
        EffectiveFees {
            platform_bps: FeeBps::new(platform).unwrap(),
            revenue_split_bps: FeeBps::new(split).unwrap(),
            custom: false,
        }
    }

    #[test]
    fn bps_bounds() {
        assert!(FeeBps::new(10_000).is_ok());
        assert!(FeeBps::new(10_001).is_err());
    }

    #[test]
    fn happy_path_split() {
        // $100 course, stablecoin at 6 decimals, 20% platform fee.
        let total = TokenAmount::from_base_units(100_000_000);
        let b = split_amount(total, &fees(2_000, 0));
        assert_eq!(b.platform_fee.base_units(), 20_000_000);
        assert_eq!(b.instructor_fee.base_units(), 80_000_000);
        assert_eq!(b.revenue_split.base_units(), 0);
    }

    #[test]
    fn revenue_split_carved_from_platform_fee() {
        let total = TokenAmount::from_base_units(100_000_000);
        let b = split_amount(total, &fees(2_000, 5_000));
        // Half of the 20% platform fee, not half of the total.
        assert_eq!(b.revenue_split.base_units(), 10_000_000);
        assert!(b.revenue_split.base_units() <= b.platform_fee.base_units());
    }

    #[test]
    fn split_sum_is_exact_over_wide_range() {
        // Property: platform + instructor == total for many (A, P) pairs,
        // including amounts that do not divide evenly.
        let amounts: Vec<u128> = vec![
            0,
            1,
            3,
            9_999,
            10_001,
            123_456_789,
            1_000_000_000_000_000_000,
            u128::MAX / 2,
            u128::MAX,
        ];
        for &a in &amounts {
            for p in (0..=10_000).step_by(7) {
                let b = split_amount(TokenAmount::from_base_units(a), &fees(p as u16, 333));
                assert_eq!(
                    b.platform_fee.base_units() + b.instructor_fee.base_units(),
                    a,
                    "leak at amount={a} bps={p}"
                );
                assert!(b.revenue_split.base_units() <= b.platform_fee.base_units());
            }
        }
    }

    #[test]
    fn full_platform_fee_leaves_instructor_zero() {
        let b = split_amount(TokenAmount::from_base_units(500), &fees(10_000, 0));
        assert_eq!(b.platform_fee.base_units(), 500);
        assert_eq!(b.instructor_fee.base_units(), 0);
    }
}
