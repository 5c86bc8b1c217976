//! Scalar conversions between floats and fixed-point integers

use crate::error::{FixedPointError, Result};
use crate::format::FixedPointFormat;

/// Largest shift applied by [`shift_signed`]; values are i32-sized so this
/// never loses the sign
const MAX_SHIFT: i32 = 62;

/// Convert a real value to the nearest stored integer of `format`.
///
/// Out-of-range results are `OverflowDetected`, never wrapped.
pub fn to_fixed(value: f64, format: FixedPointFormat) -> Result<i32> {
    if !value.is_finite() {
        return Err(FixedPointError::NonFiniteValue(value));
    }
    let scaled = (value * format.scale()).round();
    check_fits_f64(scaled, value, format)
}

fn check_fits_f64(scaled: f64, value: f64, format: FixedPointFormat) -> Result<i32> {
    if scaled < format.min_raw() as f64 || scaled > format.max_raw() as f64 {
        return Err(FixedPointError::OverflowDetected { value, format });
    }
    Ok(scaled as i32)
}

/// Real value of a stored integer
pub fn to_float(raw: i32, format: FixedPointFormat) -> f64 {
    raw as f64 / format.scale()
}

/// Hardware shift: arithmetic right shift (floor) for positive amounts, left
/// shift for negative amounts
pub fn shift_signed(value: i64, shift: i32) -> i64 {
    debug_assert!(shift.abs() <= MAX_SHIFT, "shift amount {shift} out of range");
    if shift >= 0 {
        value >> shift.min(MAX_SHIFT)
    } else {
        value << (-shift).min(MAX_SHIFT)
    }
}

/// Check that a raw value is storable in `format`
pub fn check_fits(value: i64, format: FixedPointFormat) -> Result<i32> {
    if !format.fits_raw(value) {
        return Err(FixedPointError::OverflowDetected {
            value: value as f64 / format.scale(),
            format,
        });
    }
    Ok(value as i32)
}

/// Move a stored integer from one format to another by shifting by
/// `from.F - to.F`
pub fn reformat(raw: i32, from: FixedPointFormat, to: FixedPointFormat) -> Result<i32> {
    let shift = from.fractional_bits() as i32 - to.fractional_bits() as i32;
    check_fits(shift_signed(raw as i64, shift), to)
}
