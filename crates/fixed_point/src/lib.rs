//! VPRO Fixed-Point Encoding
//!
//! Signed Q(I.F) formats for the VPRO vector accelerator: 16-bit memory words
//! and the 24-bit accumulator register. Provides the bit-width search, exact
//! float/fixed conversions, hardware shift semantics and tensor quantization.

mod error;
mod fixed;
mod format;
mod tensor;

pub use error::{FixedPointError, Result};
pub use fixed::{check_fits, reformat, shift_signed, to_fixed, to_float};
pub use format::{
    bit_width_for_range, closed_form_integer_bits, required_integer_bits, FixedPointFormat,
    ValueRange, ACCUMULATOR_BITS, MAX_FORMAT_BITS, MEMORY_WORD_BITS,
};
pub use tensor::QuantizedTensor;
