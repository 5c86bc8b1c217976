//! Network format propagation
//!
//! A single forward pass over a topologically sorted network: every conv
//! layer is planned from the output format of its predecessor, residual adds
//! pull their operands from a branch table.

use std::collections::BTreeMap;

use serde::Serialize;
use vpro_fixed_point::{FixedPointError, FixedPointFormat, QuantizedTensor, ValueRange};
use vpro_model::{BranchSource, LayerOp, NetworkConfig, WeightSource};

use crate::error::{PlanError, Result};
use crate::layer::{plan_layer, LayerContext, LayerQuantizationPlan};
use crate::merge::{plan_merge, MergePlan};
use crate::observer::ActivationObserver;
use crate::settings::QuantizationSettings;

/// Plan of one network layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedLayer {
    Conv(LayerQuantizationPlan),
    Merge(MergePlan),
}

impl PlannedLayer {
    pub fn index(&self) -> usize {
        match self {
            PlannedLayer::Conv(p) => p.index,
            PlannedLayer::Merge(p) => p.index,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PlannedLayer::Conv(p) => &p.name,
            PlannedLayer::Merge(p) => &p.name,
        }
    }

    pub fn output_format(&self) -> FixedPointFormat {
        match self {
            PlannedLayer::Conv(p) => p.output,
            PlannedLayer::Merge(p) => p.output,
        }
    }

    pub fn as_conv(&self) -> Option<&LayerQuantizationPlan> {
        match self {
            PlannedLayer::Conv(p) => Some(p),
            PlannedLayer::Merge(_) => None,
        }
    }
}

impl std::fmt::Display for PlannedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannedLayer::Conv(p) => p.fmt(f),
            PlannedLayer::Merge(p) => p.fmt(f),
        }
    }
}

/// Saved format of a tensor consumed by a residual add
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchEntry {
    pub source: BranchSource,
    pub format: FixedPointFormat,
    pub shape: Vec<usize>,
}

/// Quantized kernel and bias of a conv layer
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedParameters {
    pub kernel: QuantizedTensor,
    pub bias: QuantizedTensor,
}

/// Formats and shifts for a whole network, built once and then read-only
#[derive(Debug, Clone, Serialize)]
pub struct NetworkQuantizationPlan {
    network: String,
    input_format: FixedPointFormat,
    input_range: ValueRange,
    layers: Vec<PlannedLayer>,
    branches: Vec<BranchEntry>,
    #[serde(skip)]
    parameters: BTreeMap<usize, QuantizedParameters>,
}

impl NetworkQuantizationPlan {
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn input_format(&self) -> FixedPointFormat {
        self.input_format
    }

    pub fn input_range(&self) -> ValueRange {
        self.input_range
    }

    pub fn layers(&self) -> &[PlannedLayer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&PlannedLayer> {
        self.layers.get(index)
    }

    pub fn branches(&self) -> &[BranchEntry] {
        &self.branches
    }

    /// Format saved for a branch operand
    pub fn branch_format(&self, source: BranchSource) -> Option<FixedPointFormat> {
        self.branches
            .iter()
            .find(|b| b.source == source)
            .map(|b| b.format)
    }

    /// Quantized weights of a conv layer
    pub fn parameters(&self, index: usize) -> Option<&QuantizedParameters> {
        self.parameters.get(&index)
    }

    /// Format of the tensor a layer consumes
    pub fn layer_input_format(&self, index: usize) -> FixedPointFormat {
        index
            .checked_sub(1)
            .and_then(|i| self.layers.get(i))
            .map_or(self.input_format, PlannedLayer::output_format)
    }
}

impl std::fmt::Display for NetworkQuantizationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "network {} input {} range {}",
            self.network, self.input_format, self.input_range
        )?;
        for layer in &self.layers {
            writeln!(f, "{layer}")?;
        }
        for branch in &self.branches {
            writeln!(f, "branch {} saved as {} {:?}", branch.source, branch.format, branch.shape)?;
        }
        Ok(())
    }
}

/// Plan every layer of `network`.
///
/// Weights and biases get their own local formats; activation formats chain
/// from layer to layer. Any error aborts the whole plan.
pub fn propagate<W, O>(
    network: &NetworkConfig,
    weights: &W,
    observer: &O,
    input_range: ValueRange,
    settings: &QuantizationSettings,
) -> Result<NetworkQuantizationPlan>
where
    W: WeightSource + ?Sized,
    O: ActivationObserver + ?Sized,
{
    settings.validate()?;
    let shapes = network.output_shapes()?;
    let sources = network.branch_sources();
    let widths = &settings.widths;

    let input_format = FixedPointFormat::for_range(input_range, widths.input_bits)?;
    tracing::info!(network = %network.name, %input_range, %input_format, "planning network");

    let mut branch_table: BTreeMap<BranchSource, QuantizedTensor> = BTreeMap::new();
    if sources.contains(&BranchSource::Input) {
        if let Some(input) = observer.network_input() {
            let quantized = QuantizedTensor::quantize_with_format(
                input.data(),
                input.shape().to_vec(),
                input_format,
            )?;
            branch_table.insert(BranchSource::Input, quantized);
        }
    }

    let mut layers = Vec::with_capacity(network.layers.len());
    let mut parameters = BTreeMap::new();
    let mut current = input_format;

    for (index, layer) in network.layers.iter().enumerate() {
        let quantization_error = move |tensor: &'static str| {
            move |source: FixedPointError| PlanError::Quantization {
                layer: index,
                name: layer.name.clone(),
                tensor,
                source,
            }
        };

        match &layer.op {
            LayerOp::Conv(conv) => {
                let kernel = weights.kernel(&layer.name)?;
                let expected = [conv.in_channels, conv.out_channels, conv.kernel_elements()];
                if kernel.shape() != expected {
                    return Err(vpro_model::ModelError::InvalidShape {
                        expected: expected.to_vec(),
                        got: kernel.shape().to_vec(),
                    }
                    .into());
                }
                let bias = weights.bias(&layer.name)?;
                let kernel =
                    QuantizedTensor::quantize(kernel.data(), expected.to_vec(), widths.weight_bits)
                        .map_err(quantization_error("kernel"))?;
                let bias = QuantizedTensor::quantize(&bias, vec![bias.len()], widths.bias_bits)
                    .map_err(quantization_error("bias"))?;
                tracing::debug!(
                    layer = index,
                    kernel = %kernel.format(),
                    bias = %bias.format(),
                    "quantized parameters"
                );

                let observation = observer.observe(index)?;
                let ctx = LayerContext {
                    index,
                    name: &layer.name,
                    activation: conv.activation,
                };
                let plan = plan_layer(
                    &ctx,
                    current,
                    kernel.format(),
                    bias.format(),
                    &observation,
                    settings,
                )?;

                if sources.contains(&BranchSource::Layer(index)) {
                    let output = observation
                        .output
                        .as_ref()
                        .ok_or(PlanError::ObservationMissing { layer: index })?;
                    let saved = QuantizedTensor::quantize_with_format(
                        output.data(),
                        output.shape().to_vec(),
                        plan.output,
                    )
                    .map_err(quantization_error("output"))?;
                    branch_table.insert(BranchSource::Layer(index), saved);
                }

                current = plan.output;
                parameters.insert(index, QuantizedParameters { kernel, bias });
                layers.push(PlannedLayer::Conv(plan));
            }
            LayerOp::Add { lhs, rhs } => {
                let lhs_tensor = branch_table.get(lhs).ok_or(PlanError::MissingBranch {
                    layer: index,
                    operand: *lhs,
                })?;
                let rhs_tensor = branch_table.get(rhs).ok_or(PlanError::MissingBranch {
                    layer: index,
                    operand: *rhs,
                })?;
                let (plan, merged) = plan_merge(
                    index,
                    &layer.name,
                    (*lhs, lhs_tensor),
                    (*rhs, rhs_tensor),
                    &shapes[index],
                    widths.output_bits,
                )?;
                if sources.contains(&BranchSource::Layer(index)) {
                    branch_table.insert(BranchSource::Layer(index), merged);
                }
                current = plan.output;
                layers.push(PlannedLayer::Merge(plan));
            }
        }
    }

    let branches = branch_table
        .iter()
        .map(|(&source, tensor)| BranchEntry {
            source,
            format: tensor.format(),
            shape: tensor.shape().to_vec(),
        })
        .collect();

    Ok(NetworkQuantizationPlan {
        network: network.name.clone(),
        input_format,
        input_range,
        layers,
        branches,
        parameters,
    })
}
