//! Per-layer format planning
//!
//! For one conv + bias + activation + pool stage, derive the accumulator and
//! output formats and the three shifts that move values between formats:
//!
//! ```text
//! acc  = (sum(in * w) >> mac_shift_right) + (bias >> bias_load_shift)
//! out  = pool(act(acc)) >> output_store_shift
//! ```
//!
//! Negative shifts are left shifts.

use serde::{Deserialize, Serialize};
use vpro_fixed_point::{
    bit_width_for_range, closed_form_integer_bits, required_integer_bits, FixedPointFormat,
    ValueRange,
};
use vpro_model::Activation;

use crate::error::{PlanError, Quantity, Result};
use crate::observer::LayerObservation;
use crate::settings::QuantizationSettings;

/// Identity of the layer being planned
#[derive(Debug, Clone, Copy)]
pub struct LayerContext<'a> {
    pub index: usize,
    pub name: &'a str,
    pub activation: Activation,
}

/// Formats and shifts of one conv layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerQuantizationPlan {
    pub index: usize,
    pub name: String,
    pub activation: Activation,
    pub input: FixedPointFormat,
    pub weight: FixedPointFormat,
    pub bias: FixedPointFormat,
    pub accumulator: FixedPointFormat,
    pub output: FixedPointFormat,
    /// Shift of the raw MAC sum into the accumulator format
    pub mac_shift_right: i32,
    /// Shift aligning the bias to the accumulator format
    pub bias_load_shift: i32,
    /// Shift of the activated accumulator into the output format
    pub output_store_shift: i32,
    pub pre_activation: ValueRange,
    pub post_activation: ValueRange,
}

impl LayerQuantizationPlan {
    /// Fractional bits of a raw input * weight product
    pub fn mac_fractional_bits(&self) -> u8 {
        self.input.fractional_bits() + self.weight.fractional_bits()
    }
}

impl std::fmt::Display for LayerQuantizationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>3} {:<12} in {:<6} w {:<6} b {:<6} acc {:<6} out {:<6} mac>>{:<3} bias>>{:<3} store>>{:<3} {}",
            self.index,
            self.name,
            self.input.to_string(),
            self.weight.to_string(),
            self.bias.to_string(),
            self.accumulator.to_string(),
            self.output.to_string(),
            self.mac_shift_right,
            self.bias_load_shift,
            self.output_store_shift,
            self.activation,
        )
    }
}

fn check_ceiling(layer: usize, quantity: Quantity, required_bits: u8, ceiling: u8) -> Result<()> {
    if required_bits > ceiling {
        return Err(PlanError::FormatOverflow {
            layer,
            quantity,
            required_bits,
            ceiling,
            excess: required_bits - ceiling,
        });
    }
    Ok(())
}

/// Integer bits for `range` at `total_bits`, or `FormatOverflow` naming the
/// shortfall
fn integer_bits_within(
    layer: usize,
    quantity: Quantity,
    range: ValueRange,
    extra_bits: u8,
    total_bits: u8,
) -> Result<u8> {
    let required =
        required_integer_bits(range.min, range.max, total_bits).saturating_add(extra_bits);
    check_ceiling(layer, quantity, required, total_bits)?;
    Ok(required)
}

/// Derive the formats and shifts of one layer.
///
/// The accumulator keeps exactly the integer bits the observed pre-activation
/// range needs, leaving the rest of its width for fraction. Every format is
/// checked against its storage class; nothing is clamped.
pub fn plan_layer(
    ctx: &LayerContext<'_>,
    input: FixedPointFormat,
    weight: FixedPointFormat,
    bias: FixedPointFormat,
    observation: &LayerObservation,
    settings: &QuantizationSettings,
) -> Result<LayerQuantizationPlan> {
    let widths = &settings.widths;
    widths.validate()?;
    check_ceiling(ctx.index, Quantity::Input, input.total_bits(), widths.input_bits)?;
    check_ceiling(ctx.index, Quantity::Weight, weight.total_bits(), widths.weight_bits)?;
    check_ceiling(ctx.index, Quantity::Bias, bias.total_bits(), widths.bias_bits)?;

    let over = settings.override_for(ctx.index);
    let pre = observation.pre_activation;

    let mut acc_integer_bits = integer_bits_within(
        ctx.index,
        Quantity::Accumulator,
        pre,
        over.extra_accumulator_integer_bits,
        widths.accumulator_bits,
    )?;
    if acc_integer_bits < bias.integer_bits() {
        tracing::debug!(
            layer = ctx.index,
            from = acc_integer_bits,
            to = bias.integer_bits(),
            "raising accumulator integer bits to hold the aligned bias"
        );
        acc_integer_bits = bias.integer_bits();
    }
    check_ceiling(ctx.index, Quantity::Accumulator, acc_integer_bits, widths.accumulator_bits)?;
    let accumulator = FixedPointFormat::with_total(widths.accumulator_bits, acc_integer_bits)?;

    let iterative = required_integer_bits(pre.min, pre.max, widths.accumulator_bits);
    let closed_form = closed_form_integer_bits(pre.min, pre.max);
    if iterative != closed_form {
        tracing::debug!(
            layer = ctx.index,
            %pre,
            iterative,
            closed_form,
            "bit-width variants disagree, using the iterative search"
        );
    }

    let acc_f = accumulator.fractional_bits() as i32;
    let mac_f = input.fractional_bits() as i32 + weight.fractional_bits() as i32;
    let mac_shift_right = mac_f - acc_f;
    let bias_load_shift = bias.fractional_bits() as i32 - acc_f;

    let post = observation.post_activation;
    let out_integer_bits = integer_bits_within(
        ctx.index,
        Quantity::Output,
        post,
        over.extra_output_integer_bits,
        widths.output_bits,
    )?;
    let output = FixedPointFormat::with_total(widths.output_bits, out_integer_bits)?;
    let output_store_shift = acc_f - output.fractional_bits() as i32;

    if ctx.activation == Activation::Relu6 {
        let relu6_bits = bit_width_for_range(0.0, 6.0, widths.output_bits)?;
        if output.integer_bits() > relu6_bits {
            tracing::warn!(
                layer = ctx.index,
                name = ctx.name,
                %output,
                expected_integer_bits = relu6_bits,
                "relu6 output wider than its clamp range"
            );
        }
    }

    let plan = LayerQuantizationPlan {
        index: ctx.index,
        name: ctx.name.to_string(),
        activation: ctx.activation,
        input,
        weight,
        bias,
        accumulator,
        output,
        mac_shift_right,
        bias_load_shift,
        output_store_shift,
        pre_activation: pre,
        post_activation: post,
    };
    tracing::info!(
        layer = plan.index,
        name = %plan.name,
        input = %plan.input,
        weight = %plan.weight,
        bias = %plan.bias,
        accumulator = %plan.accumulator,
        output = %plan.output,
        mac_shift_right,
        bias_load_shift,
        output_store_shift,
        "planned layer"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(i: u8, f: u8) -> FixedPointFormat {
        FixedPointFormat::new(i, f).unwrap()
    }

    fn ctx(index: usize) -> LayerContext<'static> {
        LayerContext {
            index,
            name: "conv",
            activation: Activation::Leaky,
        }
    }

    fn observation(pre: (f64, f64), post: (f64, f64)) -> LayerObservation {
        LayerObservation::from_ranges(
            ValueRange::new(pre.0, pre.1),
            ValueRange::new(post.0, post.1),
        )
    }

    #[test]
    fn test_scenario_b_mac_shift() {
        // [-20, 25] needs 6 integer bits at 24, leaving 18 fractional
        let obs = observation((-20.0, 25.0), (-2.0, 25.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap();
        assert_eq!(plan.mac_fractional_bits(), 26);
        assert_eq!(plan.accumulator, q(6, 18));
        assert_eq!(plan.mac_shift_right, 8);
    }

    #[test]
    fn test_scenario_c_bias_left_shift() {
        let obs = observation((-20.0, 25.0), (-2.0, 25.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap();
        assert_eq!(plan.accumulator.fractional_bits(), 18);
        assert_eq!(plan.bias_load_shift, -8);
    }

    #[test]
    fn test_scenario_d_output_ceiling() {
        // [0, 300] needs 10 signed integer bits; an 8-bit output class cannot hold it
        let mut settings = QuantizationSettings::default();
        settings.widths.output_bits = 8;
        let obs = observation((0.0, 300.0), (0.0, 300.0));
        let err = plan_layer(&ctx(3), q(4, 12), q(2, 14), q(6, 10), &obs, &settings).unwrap_err();
        match err {
            PlanError::FormatOverflow {
                layer,
                quantity,
                required_bits,
                ceiling,
                excess,
            } => {
                assert_eq!(layer, 3);
                assert_eq!(quantity, Quantity::Output);
                assert_eq!(required_bits, 10);
                assert_eq!(ceiling, 8);
                assert_eq!(excess, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_output_shift_and_format() {
        let obs = observation((-20.0, 25.0), (-2.0, 25.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap();
        // [-2, 25] needs 6 integer bits at 16
        assert_eq!(plan.output, q(6, 10));
        assert_eq!(plan.output_store_shift, 8);
    }

    #[test]
    fn test_accumulator_overflow() {
        let obs = observation((-1.0e8, 1.0e8), (0.0, 1.0));
        let err = plan_layer(&ctx(1), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PlanError::FormatOverflow {
                quantity: Quantity::Accumulator,
                ceiling: 24,
                ..
            }
        ));
    }

    #[test]
    fn test_accumulator_raised_for_bias() {
        // Pre-activation needs 2 integer bits but the bias has 6
        let obs = observation((-1.0, 1.0), (0.0, 1.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap();
        assert_eq!(plan.accumulator, q(6, 18));
        assert_eq!(plan.bias_load_shift, -8);
    }

    #[test]
    fn test_negative_mac_shift_is_left() {
        // Q16.0 * Q16.0 has no fraction; a small accumulator range asks for many
        let obs = observation((-1.0, 1.0), (-1.0, 1.0));
        let plan = plan_layer(&ctx(0), q(16, 0), q(16, 0), q(1, 15), &obs, &Default::default())
            .unwrap();
        assert_eq!(plan.accumulator, q(2, 22));
        assert_eq!(plan.mac_shift_right, -22);
    }

    #[test]
    fn test_overrides_add_integer_bits() {
        let mut settings = QuantizationSettings::default();
        settings.overrides.push(crate::settings::LayerOverride {
            layer: 0,
            extra_accumulator_integer_bits: 2,
            extra_output_integer_bits: 1,
        });
        let obs = observation((-20.0, 25.0), (-2.0, 25.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &settings).unwrap();
        assert_eq!(plan.accumulator, q(8, 16));
        assert_eq!(plan.output, q(7, 9));
        assert_eq!(plan.mac_shift_right, 10);
        assert_eq!(plan.output_store_shift, 7);
    }

    #[test]
    fn test_input_wider_than_class() {
        let mut settings = QuantizationSettings::default();
        settings.widths.input_bits = 12;
        let obs = observation((-1.0, 1.0), (-1.0, 1.0));
        let err = plan_layer(&ctx(2), q(4, 12), q(2, 14), q(6, 10), &obs, &settings).unwrap_err();
        assert!(matches!(
            err,
            PlanError::FormatOverflow {
                layer: 2,
                quantity: Quantity::Input,
                required_bits: 16,
                ceiling: 12,
                excess: 4,
            }
        ));
    }

    #[test]
    fn test_display_line() {
        let obs = observation((-20.0, 25.0), (-2.0, 25.0));
        let plan = plan_layer(&ctx(0), q(4, 12), q(2, 14), q(6, 10), &obs, &Default::default())
            .unwrap();
        let line = plan.to_string();
        assert!(line.contains("acc Q6.18"));
        assert!(line.contains("mac>>8"));
        assert!(line.contains("bias>>-8"));
    }
}
