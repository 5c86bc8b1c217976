//! Bit-exact fixed-point executor
//!
//! Integer replay of one accelerator layer. All arithmetic runs on `i64` so a
//! simulator overflow can never hide a hardware overflow; the accumulator and
//! the stored output are checked against their formats explicitly.
//!
//! Overflow is always an error, in both verification modes. A value outside
//! its format would wrap on the accelerator, so unlike a rounding divergence
//! from the float reference it is not reported and skipped: the plan is wrong.

use vpro_fixed_point::{
    check_fits, shift_signed, FixedPointError, FixedPointFormat, QuantizedTensor,
};
use vpro_model::{
    conv2d, conv_output_shape, pool, Activation, ConvLayer, LEAKY_SLOPE, RELU6_CEILING,
};
use vpro_planner::{aligned_sum, LayerQuantizationPlan, MergePlan};

use crate::error::{HarnessError, Result};

/// Fractional bits of the fixed-point leaky slope
pub const LEAK_SHIFT: u8 = 18;

/// Leaky slope as an integer with `fractional_bits` fraction: round(0.1 * 2^f)
pub fn leak_constant(fractional_bits: u8) -> i64 {
    (LEAKY_SLOPE * (1u64 << fractional_bits) as f64).round() as i64
}

/// Activation on a raw accumulator value
pub fn apply_activation(x: i64, activation: Activation, accumulator: FixedPointFormat) -> i64 {
    match activation {
        Activation::Leaky if x < 0 => {
            shift_signed(x * leak_constant(LEAK_SHIFT), LEAK_SHIFT as i32)
        }
        Activation::Leaky | Activation::Linear => x,
        Activation::Relu6 => {
            let ceiling =
                shift_signed(RELU6_CEILING as i64, -(accumulator.fractional_bits() as i32));
            x.clamp(0, ceiling)
        }
    }
}

fn check_format(
    layer: usize,
    tensor: &'static str,
    expected: FixedPointFormat,
    got: FixedPointFormat,
) -> Result<()> {
    if expected != got {
        return Err(HarnessError::FormatMismatch {
            layer,
            tensor,
            expected,
            got,
        });
    }
    Ok(())
}

fn overflow(layer: usize, stage: &'static str) -> impl Fn(FixedPointError) -> HarnessError {
    move |source| HarnessError::Overflow { layer, stage, source }
}

/// Run one conv layer in integers.
///
/// conv -> mac shift -> + aligned bias -> activation -> pool -> store shift.
/// An accumulator or output value outside its format aborts the layer.
pub fn execute_layer(
    input: &QuantizedTensor,
    kernel: &QuantizedTensor,
    bias: &QuantizedTensor,
    plan: &LayerQuantizationPlan,
    conv: &ConvLayer,
) -> Result<QuantizedTensor> {
    let layer = plan.index;
    check_format(layer, "input", plan.input, input.format())?;
    check_format(layer, "weight", plan.weight, kernel.format())?;
    check_format(layer, "bias", plan.bias, bias.format())?;

    let shape: [usize; 3] = input.shape().try_into().map_err(|_| HarnessError::ShapeMismatch {
        expected: vec![conv.in_channels, 0, 0],
        got: input.shape().to_vec(),
    })?;
    if bias.len() != conv.out_channels {
        return Err(HarnessError::ShapeMismatch {
            expected: vec![conv.out_channels],
            got: bias.shape().to_vec(),
        });
    }

    let x: Vec<i64> = input.data().iter().map(|&v| v as i64).collect();
    let w: Vec<i64> = kernel.data().iter().map(|&v| v as i64).collect();
    let sums = conv2d(&x, shape, &w, conv)?;

    let conv_shape = conv_output_shape(shape, conv);
    let plane = conv_shape[1] * conv_shape[2];
    let accumulated = sums
        .iter()
        .enumerate()
        .map(|(i, &sum)| -> Result<i64> {
            let b = shift_signed(bias.data()[i / plane] as i64, plan.bias_load_shift);
            let acc = shift_signed(sum, plan.mac_shift_right) + b;
            check_fits(acc, plan.accumulator).map_err(overflow(layer, "accumulator"))?;
            Ok(apply_activation(acc, plan.activation, plan.accumulator))
        })
        .collect::<Result<Vec<i64>>>()?;

    let (pooled, out_shape) = pool(accumulated, conv_shape, conv.pool)?;
    let data = pooled
        .into_iter()
        .map(|v| check_fits(shift_signed(v, plan.output_store_shift), plan.output))
        .collect::<std::result::Result<Vec<i32>, _>>()
        .map_err(overflow(layer, "output"))?;

    tracing::debug!(
        layer,
        name = %plan.name,
        shape = ?out_shape,
        format = %plan.output,
        "executed layer"
    );
    Ok(QuantizedTensor::from_raw(out_shape.to_vec(), plan.output, data)?)
}

/// Replay a residual add
pub fn execute_merge(
    lhs: &QuantizedTensor,
    rhs: &QuantizedTensor,
    plan: &MergePlan,
) -> Result<QuantizedTensor> {
    check_format(plan.index, "lhs", plan.lhs_format, lhs.format())?;
    check_format(plan.index, "rhs", plan.rhs_format, rhs.format())?;
    if lhs.shape() != rhs.shape() {
        return Err(HarnessError::ShapeMismatch {
            expected: lhs.shape().to_vec(),
            got: rhs.shape().to_vec(),
        });
    }

    let data = aligned_sum(lhs, plan.lhs_shift_left, rhs, plan.rhs_shift_left)
        .into_iter()
        .map(|v| check_fits(shift_signed(v, plan.sum_shift_right as i32), plan.output))
        .collect::<std::result::Result<Vec<i32>, _>>()
        .map_err(overflow(plan.index, "merge"))?;
    Ok(QuantizedTensor::from_raw(lhs.shape().to_vec(), plan.output, data)?)
}
