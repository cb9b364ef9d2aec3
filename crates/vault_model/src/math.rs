//! Fixed-point math utilities
//!
//! Ratios, prices and percentages are `u128` integers scaled by [`WAD`].
//! Token amounts stay in their own decimals and are normalized to WAD only
//! where a formula mixes assets of different precision.
//!
//! Every helper is checked: overflow, underflow and division by zero are
//! returned as errors and abort the calling operation.

use crate::error::{Error, Result};

/// Fixed-point precision (18 decimals)
pub const WAD_DECIMALS: u8 = 18;
pub const WAD: u128 = 1_000_000_000_000_000_000;

const LOW_MASK: u128 = u64::MAX as u128;

#[inline]
pub fn add(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(Error::Overflow)
}

#[inline]
pub fn sub(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(Error::Underflow)
}

#[inline]
pub fn mul(a: u128, b: u128) -> Result<u128> {
    a.checked_mul(b).ok_or(Error::Overflow)
}

/// One whole token expressed in `decimals` (10^decimals)
#[inline]
pub fn unit(decimals: u8) -> Result<u128> {
    10u128.checked_pow(decimals as u32).ok_or(Error::Overflow)
}

/// Full 256-bit product of two u128 values, returned as (high, low)
fn widening_mul(a: u128, b: u128) -> (u128, u128) {
    let (a1, a0) = (a >> 64, a & LOW_MASK);
    let (b1, b0) = (b >> 64, b & LOW_MASK);

    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;

    let mid = (p00 >> 64) + (p01 & LOW_MASK) + (p10 & LOW_MASK);
    let low = (p00 & LOW_MASK) | (mid << 64);
    let high = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (high, low)
}

/// (a * b) / denom with a 256-bit intermediate, returning (quotient, remainder)
///
/// Fails only when the quotient itself does not fit in u128.
fn mul_div_rem(a: u128, b: u128, denom: u128) -> Result<(u128, u128)> {
    if denom == 0 {
        return Err(Error::DivisionByZero);
    }

    let (high, low) = widening_mul(a, b);
    if high == 0 {
        return Ok((low / denom, low % denom));
    }
    if high >= denom {
        return Err(Error::Overflow);
    }

    // Shift-subtract long division of (high, low) by denom
    let mut rem = high;
    let mut quot = 0u128;
    for bit in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((low >> bit) & 1);
        quot <<= 1;
        if carry == 1 || rem >= denom {
            rem = rem.wrapping_sub(denom);
            quot |= 1;
        }
    }
    Ok((quot, rem))
}

/// floor(a * b / denom)
pub fn mul_div_floor(a: u128, b: u128, denom: u128) -> Result<u128> {
    mul_div_rem(a, b, denom).map(|(q, _)| q)
}

/// ceil(a * b / denom)
pub fn mul_div_ceil(a: u128, b: u128, denom: u128) -> Result<u128> {
    let (q, r) = mul_div_rem(a, b, denom)?;
    if r > 0 {
        add(q, 1)
    } else {
        Ok(q)
    }
}

/// (a * b + denom / 2) / denom, i.e. round half up
pub fn mul_div_round(a: u128, b: u128, denom: u128) -> Result<u128> {
    let (q, r) = mul_div_rem(a, b, denom)?;
    if r >= denom - denom / 2 {
        add(q, 1)
    } else {
        Ok(q)
    }
}

/// WAD multiplication, rounded to nearest
#[inline]
pub fn wmul(a: u128, b: u128) -> Result<u128> {
    mul_div_round(a, b, WAD)
}

/// WAD division, rounded to nearest
#[inline]
pub fn wdiv(a: u128, b: u128) -> Result<u128> {
    mul_div_round(a, WAD, b)
}

/// Convert an amount in `decimals` into WAD precision
pub fn wrap_decimals(amount: u128, decimals: u8) -> Result<u128> {
    if decimals > WAD_DECIMALS {
        return Err(Error::InvalidConfig(format!("{decimals} decimals exceed WAD precision")));
    }
    mul(amount, unit(WAD_DECIMALS - decimals)?)
}

/// Convert a WAD amount back into `decimals` (truncating)
pub fn unwrap_decimals(amount: u128, decimals: u8) -> Result<u128> {
    if decimals > WAD_DECIMALS {
        return Err(Error::InvalidConfig(format!("{decimals} decimals exceed WAD precision")));
    }
    Ok(amount / unit(WAD_DECIMALS - decimals)?)
}

/// Convert between two token precisions (truncating when scaling down)
pub fn convert_decimals(amount: u128, from: u8, to: u8) -> Result<u128> {
    if from == to {
        Ok(amount)
    } else if from < to {
        mul(amount, unit(to - from)?)
    } else {
        Ok(amount / unit(from - to)?)
    }
}

/// Signed u128 magnitude as i128
#[inline]
pub fn to_signed(amount: u128) -> Result<i128> {
    i128::try_from(amount).map_err(|_| Error::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wmul_rounds_half_up() {
        assert_eq!(wmul(3 * WAD, 2 * WAD).unwrap(), 6 * WAD);
        // 0.5 wei rounds up
        assert_eq!(wmul(1, WAD / 2).unwrap(), 1);
        // 0.4999.. wei rounds down
        assert_eq!(wmul(1, WAD / 2 - 1).unwrap(), 0);
    }

    #[test]
    fn test_wdiv() {
        assert_eq!(wdiv(WAD, 2 * WAD).unwrap(), WAD / 2);
        assert_eq!(wdiv(2, 3).unwrap(), 666_666_666_666_666_667);
        assert_eq!(wdiv(1, 0), Err(Error::DivisionByZero));
    }

    #[test]
    fn test_mul_div_wide_intermediate() {
        // 1e30 * 1e30 overflows u128 but the quotient fits
        let a = 10u128.pow(30);
        let q = mul_div_floor(a, a, 10u128.pow(30)).unwrap();
        assert_eq!(q, a);

        let q = mul_div_floor(u128::MAX, u128::MAX, u128::MAX).unwrap();
        assert_eq!(q, u128::MAX);

        let q = mul_div_floor(u128::MAX, 3, 4).unwrap();
        assert_eq!(q, u128::MAX / 4 * 3 + 2);
    }

    #[test]
    fn test_mul_div_ceil() {
        assert_eq!(mul_div_ceil(10, 1, 3).unwrap(), 4);
        assert_eq!(mul_div_ceil(9, 1, 3).unwrap(), 3);
        assert_eq!(mul_div_ceil(0, 7, 3).unwrap(), 0);
    }

    #[test]
    fn test_mul_div_quotient_overflow() {
        assert_eq!(mul_div_floor(u128::MAX, 2, 1), Err(Error::Overflow));
    }

    #[test]
    fn test_checked_add_sub() {
        assert_eq!(add(u128::MAX, 1), Err(Error::Overflow));
        assert_eq!(sub(0, 1), Err(Error::Underflow));
        assert_eq!(sub(5, 3).unwrap(), 2);
    }

    #[test]
    fn test_decimals_roundtrip() {
        let wad = wrap_decimals(1_500_000, 6).unwrap();
        assert_eq!(wad, 15 * WAD / 10);
        assert_eq!(unwrap_decimals(wad, 6).unwrap(), 1_500_000);
        assert_eq!(convert_decimals(1_000_000, 6, 18).unwrap(), WAD);
        assert_eq!(convert_decimals(WAD + 7, 18, 6).unwrap(), 1_000_000);
        assert!(wrap_decimals(1, 19).is_err());
    }
}
