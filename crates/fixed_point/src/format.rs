//! Q(I.F) format model and bit-width search
//!
//! A format with `I` integer bits (sign bit included) and `F` fractional bits
//! stores a real value `x` as the signed integer `x * 2^F` in `I + F` bits, so
//! it covers `[-2^(I-1), 2^(I-1) - 2^-F]`.

use serde::{Deserialize, Serialize};

use crate::error::{FixedPointError, Result};

/// Width of a VPRO memory word (weights, biases, activations at rest)
pub const MEMORY_WORD_BITS: u8 = 16;

/// Width of the VPRO accumulator register file
pub const ACCUMULATOR_BITS: u8 = 24;

/// Widest format the simulator handles (values are carried in i32)
pub const MAX_FORMAT_BITS: u8 = 32;

/// Upper bound for the uncapped integer-bit search
const SEARCH_LIMIT_BITS: u8 = 128;

/// A signed two's-complement fixed-point format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedPointFormat {
    integer_bits: u8,
    fractional_bits: u8,
}

impl FixedPointFormat {
    /// Create a format, rejecting zero-width and wider-than-i32 formats
    pub fn new(integer_bits: u8, fractional_bits: u8) -> Result<Self> {
        let total = integer_bits as u16 + fractional_bits as u16;
        if total == 0 || total > MAX_FORMAT_BITS as u16 {
            return Err(FixedPointError::InvalidFormat {
                integer_bits,
                fractional_bits,
            });
        }
        Ok(Self {
            integer_bits,
            fractional_bits,
        })
    }

    /// Create a format of `total_bits` width with the given integer part
    pub fn with_total(total_bits: u8, integer_bits: u8) -> Result<Self> {
        if integer_bits > total_bits {
            return Err(FixedPointError::InvalidFormat {
                integer_bits,
                fractional_bits: 0,
            });
        }
        Self::new(integer_bits, total_bits - integer_bits)
    }

    /// Smallest format of `total_bits` width that covers `range`
    pub fn for_range(range: ValueRange, total_bits: u8) -> Result<Self> {
        let integer_bits = bit_width_for_range(range.min, range.max, total_bits)?;
        Self::with_total(total_bits, integer_bits)
    }

    pub fn integer_bits(&self) -> u8 {
        self.integer_bits
    }

    pub fn fractional_bits(&self) -> u8 {
        self.fractional_bits
    }

    pub fn total_bits(&self) -> u8 {
        self.integer_bits + self.fractional_bits
    }

    /// `2^F` as a float
    pub fn scale(&self) -> f64 {
        pow2(self.fractional_bits as i32)
    }

    /// Smallest stored integer
    pub fn min_raw(&self) -> i64 {
        -(1i64 << (self.total_bits() - 1))
    }

    /// Largest stored integer
    pub fn max_raw(&self) -> i64 {
        (1i64 << (self.total_bits() - 1)) - 1
    }

    /// Smallest representable real value
    pub fn min_value(&self) -> f64 {
        -pow2(self.integer_bits as i32 - 1)
    }

    /// Largest representable real value
    pub fn max_value(&self) -> f64 {
        pow2(self.integer_bits as i32 - 1) - pow2(-(self.fractional_bits as i32))
    }

    /// Whether a raw integer is storable in this format
    pub fn fits_raw(&self, raw: i64) -> bool {
        raw >= self.min_raw() && raw <= self.max_raw()
    }

    /// Whether every value of `range` is representable without overflow
    pub fn covers(&self, range: ValueRange) -> bool {
        range.min >= self.min_value() && range.max <= self.max_value()
    }
}

impl std::fmt::Display for FixedPointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Q{}.{}", self.integer_bits, self.fractional_bits)
    }
}

/// An observed closed value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// Create a range; the arguments may come in either order
    pub fn new(a: f64, b: f64) -> Self {
        if a > b {
            Self { min: b, max: a }
        } else {
            Self { min: a, max: b }
        }
    }

    /// Range of a slice, `None` when empty
    pub fn of(values: &[f64]) -> Option<Self> {
        let first = *values.first()?;
        let (min, max) = values
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Some(Self { min, max })
    }

    /// Range of raw integers interpreted in `format`
    pub fn of_raw(values: &[i32], format: FixedPointFormat) -> Option<Self> {
        let lo = *values.iter().min()?;
        let hi = *values.iter().max()?;
        Some(Self {
            min: lo as f64 / format.scale(),
            max: hi as f64 / format.scale(),
        })
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.6}, {:.6}]", self.min, self.max)
    }
}

fn pow2(exp: i32) -> f64 {
    2f64.powi(exp)
}

/// Lower bound of a format with `integer_bits` integer bits
fn table_min(integer_bits: u8) -> f64 {
    -pow2(integer_bits as i32 - 1)
}

/// Upper bound of a format with `integer_bits` integer bits out of `total_bits`.
/// Past `total_bits` the format is integer-only.
fn table_max(integer_bits: u8, total_bits: u8) -> f64 {
    let fractional = (total_bits as i32 - integer_bits as i32).max(0);
    pow2(integer_bits as i32 - 1) - pow2(-fractional)
}

/// Integer bits needed to hold `[min, max]`, searching past `total_bits`.
///
/// Walks the format table upwards from zero integer bits, so it returns the
/// same answer as the hardware table lookup. Saturates at 128 bits.
pub fn required_integer_bits(min: f64, max: f64, total_bits: u8) -> u8 {
    let range = ValueRange::new(min, max);
    let mut bits = 0u8;
    while bits < SEARCH_LIMIT_BITS
        && (table_min(bits) > range.min || table_max(bits, total_bits) < range.max)
    {
        bits += 1;
    }
    bits
}

/// Minimal integer bits such that `(b, total_bits - b)` covers `[min, max]`.
///
/// Fails with `PrecisionExceeded` when even an integer-only format of
/// `total_bits` cannot hold the range.
pub fn bit_width_for_range(min: f64, max: f64, total_bits: u8) -> Result<u8> {
    for v in [min, max] {
        if !v.is_finite() {
            return Err(FixedPointError::NonFiniteValue(v));
        }
    }
    let required = required_integer_bits(min, max, total_bits);
    if required > total_bits {
        let range = ValueRange::new(min, max);
        return Err(FixedPointError::PrecisionExceeded {
            min: range.min,
            max: range.max,
            total_bits,
            required_bits: required,
        });
    }
    Ok(required)
}

/// Closed-form `ceil(log2(max(|min|, |max| + 1))) + 1` estimate.
///
/// Disagrees with [`bit_width_for_range`] near power-of-two boundaries and for
/// ranges inside `[-0.5, 0.5)`; only used to flag those cases.
pub fn closed_form_integer_bits(min: f64, max: f64) -> u8 {
    let value = min.abs().max(max.abs() + 1.0);
    (value.log2().ceil() as i64 + 1).clamp(0, u8::MAX as i64) as u8
}
