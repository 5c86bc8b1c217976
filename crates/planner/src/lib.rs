//! VPRO Quantization Planner
//!
//! Derives fixed-point formats and shift amounts for every layer of a CNN:
//! - Layer planning: accumulator/output formats and MAC, bias and store shifts
//! - Network propagation: chains output formats into the next layer's input
//! - Residual merges: operand alignment and re-quantization of the sum
//!
//! The planner performs no I/O. Activation statistics come from an
//! [`ActivationObserver`], weights from a [`vpro_model::WeightSource`].

mod error;
mod layer;
mod merge;
mod network;
mod observer;
mod settings;

pub use error::{PlanError, Quantity, Result};
pub use layer::{plan_layer, LayerContext, LayerQuantizationPlan};
pub use merge::{aligned_sum, plan_merge, MergePlan};
pub use network::{
    propagate, BranchEntry, NetworkQuantizationPlan, PlannedLayer, QuantizedParameters,
};
pub use observer::{ActivationObserver, LayerObservation, ObservationTable};
pub use settings::{BitWidths, LayerOverride, QuantizationSettings, VerifyMode};
