//! Fixed-point error types

use thiserror::Error;

use crate::format::FixedPointFormat;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FixedPointError {
    #[error(
        "Precision exceeded: range [{min}, {max}] needs {required_bits} integer bits, \
         only {total_bits} available"
    )]
    PrecisionExceeded {
        min: f64,
        max: f64,
        total_bits: u8,
        required_bits: u8,
    },

    #[error("Overflow detected: {value} is outside the representable range of {format}")]
    OverflowDetected { value: f64, format: FixedPointFormat },

    #[error("Invalid format: {integer_bits} integer + {fractional_bits} fractional bits")]
    InvalidFormat { integer_bits: u8, fractional_bits: u8 },

    #[error("Non-finite value {0} cannot be quantized")]
    NonFiniteValue(f64),

    #[error("Empty tensor has no value range")]
    EmptyTensor,

    #[error("Shape mismatch: shape holds {expected} elements, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, FixedPointError>;
