//! Residual merge planning
//!
//! Two tensors in different formats are aligned to the finer fraction with
//! left shifts, summed as integers, and shifted right until the sum fits the
//! output word again.

use serde::{Deserialize, Serialize};
use vpro_fixed_point::{required_integer_bits, shift_signed, FixedPointFormat, QuantizedTensor};
use vpro_model::BranchSource;

use crate::error::{PlanError, Quantity, Result};

/// Formats and shifts of one residual add
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub index: usize,
    pub name: String,
    pub lhs: BranchSource,
    pub rhs: BranchSource,
    pub lhs_format: FixedPointFormat,
    pub rhs_format: FixedPointFormat,
    /// Fractional bits both operands are aligned to
    pub common_fractional_bits: u8,
    pub lhs_shift_left: u8,
    pub rhs_shift_left: u8,
    /// Right shift applied to the integer sum
    pub sum_shift_right: u8,
    pub output: FixedPointFormat,
}

impl std::fmt::Display for MergePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>3} {:<12} add {} ({}) << {} + {} ({}) << {}, sum>>{} out {}",
            self.index,
            self.name,
            self.lhs,
            self.lhs_format,
            self.lhs_shift_left,
            self.rhs,
            self.rhs_format,
            self.rhs_shift_left,
            self.sum_shift_right,
            self.output,
        )
    }
}

/// Integer sum of both operands after alignment, in the common fraction
pub fn aligned_sum(
    lhs: &QuantizedTensor,
    lhs_shift: u8,
    rhs: &QuantizedTensor,
    rhs_shift: u8,
) -> Vec<i64> {
    lhs.data()
        .iter()
        .zip(rhs.data())
        .map(|(&a, &b)| {
            shift_signed(a as i64, -(lhs_shift as i32))
                + shift_signed(b as i64, -(rhs_shift as i32))
        })
        .collect()
}

/// Plan a residual add and produce the merged tensor.
///
/// `expected_shape` is the shape the consumer was wired for; both operands
/// must match it.
pub fn plan_merge(
    index: usize,
    name: &str,
    lhs: (BranchSource, &QuantizedTensor),
    rhs: (BranchSource, &QuantizedTensor),
    expected_shape: &[usize],
    output_bits: u8,
) -> Result<(MergePlan, QuantizedTensor)> {
    for (operand, tensor) in [lhs, rhs] {
        if tensor.shape() != expected_shape {
            return Err(PlanError::BranchFormatMismatch {
                layer: index,
                operand,
                expected: expected_shape.to_vec(),
                got: tensor.shape().to_vec(),
            });
        }
    }

    let (lhs_source, lhs) = lhs;
    let (rhs_source, rhs) = rhs;
    let common = lhs.format().fractional_bits().max(rhs.format().fractional_bits());
    let lhs_shift_left = common - lhs.format().fractional_bits();
    let rhs_shift_left = common - rhs.format().fractional_bits();

    let sum = aligned_sum(lhs, lhs_shift_left, rhs, rhs_shift_left);
    let lo = sum.iter().copied().min().unwrap_or(0);
    let hi = sum.iter().copied().max().unwrap_or(0);
    // Integer-only search: width of the raw sum in signed bits
    let sum_bits = required_integer_bits(lo as f64, hi as f64, 0);

    let sum_shift_right = sum_bits
        .saturating_sub(output_bits)
        .max(common.saturating_sub(output_bits));
    if sum_shift_right > common {
        let required_bits = sum_bits - common;
        return Err(PlanError::FormatOverflow {
            layer: index,
            quantity: Quantity::Output,
            required_bits,
            ceiling: output_bits,
            excess: required_bits.saturating_sub(output_bits),
        });
    }

    let fractional_bits = common - sum_shift_right;
    let output = FixedPointFormat::with_total(output_bits, output_bits - fractional_bits)?;
    let data = sum
        .iter()
        .map(|&v| shift_signed(v, sum_shift_right as i32))
        .map(|v| i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX }))
        .collect();
    let merged = QuantizedTensor::from_raw(expected_shape.to_vec(), output, data)?;

    let plan = MergePlan {
        index,
        name: name.to_string(),
        lhs: lhs_source,
        rhs: rhs_source,
        lhs_format: lhs.format(),
        rhs_format: rhs.format(),
        common_fractional_bits: common,
        lhs_shift_left,
        rhs_shift_left,
        sum_shift_right,
        output,
    };
    tracing::info!(
        layer = index,
        name,
        lhs = %plan.lhs_format,
        rhs = %plan.rhs_format,
        sum_bits,
        sum_shift_right,
        output = %plan.output,
        "planned residual merge"
    );
    Ok((plan, merged))
}
