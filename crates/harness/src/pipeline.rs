//! End-to-end quantization pipeline
//!
//! Float reference -> format propagation -> integer execution -> verification.

use vpro_fixed_point::QuantizedTensor;
use vpro_model::{BranchSource, FloatTensor, LayerOp, NetworkConfig, WeightSource};
use vpro_planner::{
    propagate, NetworkQuantizationPlan, PlannedLayer, QuantizationSettings, VerifyMode,
};

use crate::error::{HarnessError, Result};
use crate::executor::{execute_layer, execute_merge};
use crate::reference::FloatReference;
use crate::verify::{verify_layer, VerificationReport};

/// Everything a pipeline run produces
#[derive(Debug)]
pub struct PipelineOutput {
    pub plan: NetworkQuantizationPlan,
    pub reference: FloatReference,
    /// The network input in the planned input format
    pub input: QuantizedTensor,
    /// Executor output of every layer (golden data)
    pub outputs: Vec<QuantizedTensor>,
    pub report: VerificationReport,
}

/// Plans, executes and verifies one network
pub struct QuantizationPipeline {
    network: NetworkConfig,
    settings: QuantizationSettings,
}

impl QuantizationPipeline {
    pub fn new(network: NetworkConfig, settings: QuantizationSettings) -> Result<Self> {
        network.validate()?;
        settings.validate()?;
        Ok(Self { network, settings })
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn settings(&self) -> &QuantizationSettings {
        &self.settings
    }

    /// Run the float reference and derive the plan from what it observed
    pub fn plan<W>(
        &self,
        weights: &W,
        input: &FloatTensor,
    ) -> Result<(FloatReference, NetworkQuantizationPlan)>
    where
        W: WeightSource + ?Sized,
    {
        let reference = FloatReference::run(&self.network, weights, input, &self.settings.widths)?;
        let input_range = input
            .range()
            .ok_or_else(|| HarnessError::InvalidInput("network input is empty".to_string()))?;
        let plan = propagate(&self.network, weights, &reference, input_range, &self.settings)?;
        Ok((reference, plan))
    }

    /// Plan, then execute every layer in integers and verify against the
    /// float reference.
    ///
    /// Layers beyond the divergence tolerance are collected in the report and
    /// the run carries on. Executor overflow ends the run with an error.
    pub fn run<W>(&self, weights: &W, input: &FloatTensor) -> Result<PipelineOutput>
    where
        W: WeightSource + ?Sized,
    {
        let (reference, plan) = self.plan(weights, input)?;
        let quantized_input = QuantizedTensor::quantize_with_format(
            input.data(),
            input.shape().to_vec(),
            plan.input_format(),
        )?;

        let mode = self.settings.verify_mode;
        let mut report = VerificationReport::new(self.settings.divergence_tolerance);
        let mut outputs: Vec<QuantizedTensor> = Vec::with_capacity(self.network.num_layers());

        for (index, layer) in self.network.layers.iter().enumerate() {
            let ctx = LayerInputs {
                mode,
                plan: &plan,
                reference: &reference,
                input: &quantized_input,
                outputs: &outputs,
            };
            let output = match (&layer.op, plan.layer(index)) {
                (LayerOp::Conv(conv), Some(PlannedLayer::Conv(layer_plan))) => {
                    let params = plan.parameters(index).ok_or_else(|| {
                        HarnessError::InvalidInput(format!(
                            "no quantized parameters for layer {index}"
                        ))
                    })?;
                    let source = match index.checked_sub(1) {
                        Some(previous) => BranchSource::Layer(previous),
                        None => BranchSource::Input,
                    };
                    let layer_input = ctx.operand(source)?;
                    let output = execute_layer(
                        &layer_input,
                        &params.kernel,
                        &params.bias,
                        layer_plan,
                        conv,
                    )?;

                    let expected = reference.output(index).ok_or_else(|| {
                        HarnessError::InvalidInput(format!("no reference output for layer {index}"))
                    })?;
                    report.record(verify_layer(index, &layer.name, &output, expected)?);
                    output
                }
                (LayerOp::Add { lhs, rhs }, Some(PlannedLayer::Merge(merge_plan))) => {
                    execute_merge(&ctx.operand(*lhs)?, &ctx.operand(*rhs)?, merge_plan)?
                }
                _ => {
                    return Err(HarnessError::InvalidInput(format!(
                        "plan does not match the network at layer {index}"
                    )))
                }
            };
            outputs.push(output);
        }

        tracing::info!(
            network = %self.network.name,
            layers = outputs.len(),
            ?mode,
            max_abs_diff = report.max_abs_diff(),
            divergences = report.divergences.len(),
            "pipeline finished"
        );

        Ok(PipelineOutput {
            plan,
            reference,
            input: quantized_input,
            outputs,
            report,
        })
    }
}

/// Where a layer's fixed-point operands come from
struct LayerInputs<'a> {
    mode: VerifyMode,
    plan: &'a NetworkQuantizationPlan,
    reference: &'a FloatReference,
    input: &'a QuantizedTensor,
    outputs: &'a [QuantizedTensor],
}

impl LayerInputs<'_> {
    /// Chained mode consumes executor outputs. Per-layer mode restarts every
    /// conv layer from the float reference quantized into the planned format;
    /// merge outputs are already exact and are reused in both modes.
    fn operand(&self, source: BranchSource) -> Result<QuantizedTensor> {
        let BranchSource::Layer(j) = source else {
            return Ok(self.input.clone());
        };
        let executed = self
            .outputs
            .get(j)
            .ok_or_else(|| HarnessError::InvalidInput(format!("layer {j} has not run yet")))?;
        match (self.mode, self.plan.layer(j)) {
            (VerifyMode::PerLayer, Some(PlannedLayer::Conv(producer))) => {
                let reference = self.reference.output(j).ok_or_else(|| {
                    HarnessError::InvalidInput(format!("no reference output for layer {j}"))
                })?;
                Ok(QuantizedTensor::quantize_with_format(
                    reference.data(),
                    reference.shape().to_vec(),
                    producer.output,
                )?)
            }
            _ => Ok(executed.clone()),
        }
    }
}
