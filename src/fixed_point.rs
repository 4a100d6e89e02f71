//! # 17.14 Fixed-Point Arithmetic
//!
//! Signed fixed-point numbers with 17 integer bits and 14 fraction bits,
//! stored in an `i32`. Used only by the MLFQS policy, where `recent_cpu`
//! and the load average must be recomputed without floating point.
//!
//! ```text
//!  31 30            14 13             0
//! ┌──┬───────────────┬────────────────┐
//! │ S│  integer (17) │  fraction (14) │
//! └──┴───────────────┴────────────────┘
//! ```
//!
//! Products and quotients are widened to `i64` before rescaling so that
//! intermediate values do not overflow.

use core::ops::{Add, Div, Mul, Neg, Sub};

/// Number of fraction bits.
pub const FRACTION_BITS: u32 = 14;

/// Scale factor, `2^14`.
pub const F: i32 = 1 << FRACTION_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(F);

    /// Reinterpret a raw 17.14 bit pattern.
    pub const fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn from_int(n: i32) -> Self {
        Fixed(n * F)
    }

    /// `n / d` as a fixed-point value, e.g. `ratio(59, 60)`.
    pub const fn ratio(n: i32, d: i32) -> Self {
        Fixed::from_int(n).div_int(d)
    }

    /// Convert to an integer, truncating toward zero.
    pub const fn to_int_trunc(self) -> i32 {
        self.0 / F
    }

    /// Convert to the nearest integer; halves round away from zero.
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub const fn add_int(self, n: i32) -> Self {
        Fixed(self.0 + n * F)
    }

    pub const fn mul_int(self, n: i32) -> Self {
        Fixed(self.0 * n)
    }

    pub const fn div_int(self, n: i32) -> Self {
        Fixed(self.0 / n)
    }

    pub const fn mul_fixed(self, rhs: Fixed) -> Self {
        Fixed(((self.0 as i64) * (rhs.0 as i64) / F as i64) as i32)
    }

    pub const fn div_fixed(self, rhs: Fixed) -> Self {
        Fixed(((self.0 as i64) * F as i64 / rhs.0 as i64) as i32)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

impl Mul for Fixed {
    type Output = Fixed;

    fn mul(self, rhs: Fixed) -> Fixed {
        self.mul_fixed(rhs)
    }
}

impl Div for Fixed {
    type Output = Fixed;

    fn div(self, rhs: Fixed) -> Fixed {
        self.div_fixed(rhs)
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    fn neg(self) -> Fixed {
        Fixed(-self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_round_trip() {
        for n in (-131_072..=131_071).step_by(97) {
            assert_eq!(Fixed::from_int(n).to_int_round(), n);
            assert_eq!(Fixed::from_int(n).to_int_trunc(), n);
        }
        assert_eq!(Fixed::from_int(131_071).to_int_round(), 131_071);
        assert_eq!(Fixed::from_int(-131_072).to_int_round(), -131_072);
    }

    #[test]
    fn test_truncation_toward_zero() {
        assert_eq!(Fixed::ratio(7, 2).to_int_trunc(), 3);
        assert_eq!(Fixed::ratio(-7, 2).to_int_trunc(), -3);
        assert_eq!(Fixed::ratio(1, 3).to_int_trunc(), 0);
    }

    #[test]
    fn test_rounding_halves_away_from_zero() {
        assert_eq!(Fixed::ratio(5, 2).to_int_round(), 3);
        assert_eq!(Fixed::ratio(-5, 2).to_int_round(), -3);
        assert_eq!(Fixed::ratio(9, 4).to_int_round(), 2);
        assert_eq!(Fixed::ratio(-9, 4).to_int_round(), -2);
        assert_eq!(Fixed::from_raw(F / 2).to_int_round(), 1);
        assert_eq!(Fixed::from_raw(F / 2 - 1).to_int_round(), 0);
    }

    #[test]
    fn test_mul_div() {
        let a = Fixed::from_int(6);
        let b = Fixed::ratio(1, 2);
        assert_eq!((a * b).to_int_round(), 3);
        assert_eq!((a / b).to_int_round(), 12);
        assert_eq!(a.mul_int(3), Fixed::from_int(18));
        assert_eq!(a.div_int(4).to_int_round(), 2);
        assert_eq!((a + b - Fixed::ONE).mul_int(2), Fixed::from_int(11));
    }

    #[test]
    fn test_wide_intermediate() {
        // 100 * 100 overflows an i32 once scaled twice
        let big = Fixed::from_int(100);
        assert_eq!((big * big).to_int_trunc(), 10_000);
        assert_eq!((Fixed::from_int(10_000) / big).to_int_trunc(), 100);
    }

    #[test]
    fn test_load_average_step() {
        // One ready thread for one second from an idle system
        let load = Fixed::ratio(59, 60) * Fixed::ZERO + Fixed::ratio(1, 60).mul_int(1);
        assert_eq!(load.mul_int(100).to_int_round(), 2);
        assert_eq!(-load, Fixed::ZERO - load);
    }
}
