//! Fixed-point rescaling: an integer multiplier followed by a rounding right shift.

/// Bits of precision kept in a multiplier derived from a real ratio.
pub const MUL_PRECISION: u32 = 16;

/// Hard cap on the shift so `x * mul` stays inside `i128` for realistic accumulators.
const MAX_RSHIFT: u32 = 96;

/// `x ↦ round(x * mul / 2^rshift)`, rounding half away from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMul {
    pub mul: i64,
    pub rshift: u32,
}

impl FixedMul {
    pub const IDENTITY: FixedMul = FixedMul { mul: 1, rshift: 0 };

    /// Nearest fixed-point realisation of a positive finite ratio.
    ///
    /// Returns `None` for ratios that are not positive and finite.
    pub fn from_ratio(ratio: f64) -> Option<Self> {
        let rshift = shift_for(ratio)?;
        let mul = (ratio * 2f64.powi(rshift as i32)).round();
        if mul < 1.0 || mul > i64::MAX as f64 {
            return None;
        }
        Some(FixedMul {
            mul: mul as i64,
            rshift,
        })
    }

    /// The real ratio this multiplier actually implements.
    pub fn ratio(&self) -> f64 {
        self.mul as f64 / 2f64.powi(self.rshift as i32)
    }

    pub fn apply(&self, x: i128) -> i128 {
        round_shift(x.saturating_mul(self.mul as i128), self.rshift)
    }
}

/// Shift that puts `ratio * 2^shift` into `[2^(P-1), 2^P)`, clamped to `0..=MAX_RSHIFT`.
pub fn shift_for(ratio: f64) -> Option<u32> {
    if !(ratio.is_finite() && ratio > 0.0) {
        return None;
    }
    let exp = ratio.log2().floor() as i64;
    let shift = (MUL_PRECISION as i64 - 1 - exp).clamp(0, MAX_RSHIFT as i64);
    Some(shift as u32)
}

/// Arithmetic right shift rounding half away from zero.
pub fn round_shift(x: i128, rshift: u32) -> i128 {
    if rshift == 0 {
        return x;
    }
    let half = 1i128 << (rshift - 1);
    if x >= 0 {
        x.saturating_add(half) >> rshift
    } else {
        -((x.saturating_neg().saturating_add(half)) >> rshift)
    }
}

/// `round(v)` with halves away from zero, as `f64::round` does.
pub fn quantize_value(v: f64, scale: f64) -> i128 {
    let q = (v * scale).round();
    if q >= i128::MAX as f64 {
        i128::MAX
    } else if q <= i128::MIN as f64 {
        i128::MIN
    } else {
        q as i128
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_shift_halves_away_from_zero() {
        assert_eq!(round_shift(5, 1), 3); // 2.5
        assert_eq!(round_shift(-5, 1), -3); // -2.5
        assert_eq!(round_shift(4, 1), 2);
        assert_eq!(round_shift(7, 2), 2); // 1.75
        assert_eq!(round_shift(-7, 2), -2);
        assert_eq!(round_shift(9, 0), 9);
    }

    #[test]
    fn power_of_two_ratios_are_exact() {
        let one = FixedMul::from_ratio(1.0).unwrap();
        assert_eq!(one.ratio(), 1.0);
        assert_eq!(one.apply(12345), 12345);

        let quarter = FixedMul::from_ratio(0.25).unwrap();
        assert_eq!(quarter.ratio(), 0.25);
        assert_eq!(quarter.apply(10), 3); // 2.5 rounds away from zero
    }

    #[test]
    fn multiplier_keeps_precision() {
        let m = FixedMul::from_ratio(127.0 / 120.0).unwrap();
        assert!(m.mul >= 1 << (MUL_PRECISION - 1));
        assert!(m.mul < 1 << MUL_PRECISION);
        assert!((m.ratio() - 127.0 / 120.0).abs() < 1e-4);
    }

    #[test]
    fn large_ratios_use_no_shift() {
        let m = FixedMul::from_ratio(3.0e6).unwrap();
        assert_eq!(m.rshift, 0);
        assert_eq!(m.mul, 3_000_000);
    }

    #[test]
    fn invalid_ratios_rejected() {
        assert!(FixedMul::from_ratio(0.0).is_none());
        assert!(FixedMul::from_ratio(-1.0).is_none());
        assert!(FixedMul::from_ratio(f64::NAN).is_none());
        assert!(FixedMul::from_ratio(f64::INFINITY).is_none());
    }
}
