//! Money and percentage types
//!
//! Amounts are whole cents in an `i64`; percentages are basis points
//! (10_000 = 100%). Intermediate products use `i128`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Basis points in one whole
pub const BPS_SCALE: i128 = 10_000;

/// A monetary amount in cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Whole currency units, e.g. `Amount::from_units(10)` is 10.00
    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Percentage of this amount, rounded down to the cent
    pub fn percent_floor(self, bps: BasisPoints) -> Amount {
        let product = self.0 as i128 * bps.0 as i128;
        Amount(product.div_euclid(BPS_SCALE) as i64)
    }

    /// Percentage of this amount, rounded up to the cent
    pub fn percent_ceil(self, bps: BasisPoints) -> Amount {
        let product = self.0 as i128 * bps.0 as i128;
        let floor = product.div_euclid(BPS_SCALE);
        let ceil = if product.rem_euclid(BPS_SCALE) == 0 {
            floor
        } else {
            floor + 1
        };
        Amount(ceil as i64)
    }

    /// Split evenly between `parts` recipients. Returns (share, remainder).
    pub fn split_even(self, parts: u64) -> (Amount, Amount) {
        if parts == 0 {
            return (Amount::ZERO, self);
        }
        let parts = parts as i64;
        let share = self.0.div_euclid(parts);
        (Amount(share), Amount(self.0 - share * parts))
    }

    /// Multiply by a count
    pub fn times(self, count: u64) -> Amount {
        Amount(self.0 * count as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

/// A percentage expressed in basis points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);
    pub const FULL: BasisPoints = BasisPoints(10_000);

    /// Whole percent, e.g. `BasisPoints::percent(5)` is 5%
    pub const fn percent(p: u32) -> Self {
        Self(p * 100)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl Add for BasisPoints {
    type Output = BasisPoints;
    fn add(self, rhs: BasisPoints) -> BasisPoints {
        BasisPoints(self.0 + rhs.0)
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
