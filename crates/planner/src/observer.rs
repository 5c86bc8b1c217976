//! Activation observation interface

use vpro_fixed_point::ValueRange;
use vpro_model::FloatTensor;

use crate::error::{PlanError, Result};

/// What a forward pass saw at one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerObservation {
    /// Range of conv + bias, before activation and pooling
    pub pre_activation: ValueRange,
    /// Range of the layer output
    pub post_activation: ValueRange,
    /// Full output, needed when the layer feeds a residual add
    pub output: Option<FloatTensor>,
}

impl LayerObservation {
    pub fn from_ranges(pre_activation: ValueRange, post_activation: ValueRange) -> Self {
        Self {
            pre_activation,
            post_activation,
            output: None,
        }
    }

    /// Observation carrying the full output; `None` for an empty tensor
    pub fn with_output(pre_activation: ValueRange, output: FloatTensor) -> Option<Self> {
        Some(Self {
            pre_activation,
            post_activation: output.range()?,
            output: Some(output),
        })
    }
}

/// Source of per-layer activation statistics.
///
/// Typically a float forward pass over a representative input.
pub trait ActivationObserver {
    fn observe(&self, layer: usize) -> Result<LayerObservation>;

    /// The network input, when a residual add consumes it
    fn network_input(&self) -> Option<FloatTensor> {
        None
    }
}

/// Precomputed observations, one per layer
#[derive(Debug, Clone, Default)]
pub struct ObservationTable {
    layers: Vec<Option<LayerObservation>>,
    input: Option<FloatTensor>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: usize, observation: LayerObservation) {
        if self.layers.len() <= layer {
            self.layers.resize(layer + 1, None);
        }
        self.layers[layer] = Some(observation);
    }

    pub fn set_input(&mut self, input: FloatTensor) {
        self.input = Some(input);
    }
}

impl ActivationObserver for ObservationTable {
    fn observe(&self, layer: usize) -> Result<LayerObservation> {
        self.layers
            .get(layer)
            .and_then(|o| o.clone())
            .ok_or(PlanError::ObservationMissing { layer })
    }

    fn network_input(&self) -> Option<FloatTensor> {
        self.input.clone()
    }
}
