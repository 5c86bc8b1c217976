//! Planner error types

use serde::Serialize;
use thiserror::Error;
use vpro_fixed_point::FixedPointError;
use vpro_model::{BranchSource, ModelError};

/// Quantity whose format is checked against a storage ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Weight,
    Input,
    Accumulator,
    Bias,
    Output,
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Quantity::Weight => "weight",
            Quantity::Input => "input",
            Quantity::Accumulator => "accumulator",
            Quantity::Bias => "bias",
            Quantity::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Layer {layer}: {quantity} needs {required_bits} bits but its ceiling is {ceiling} ({excess} over)")]
    FormatOverflow {
        layer: usize,
        quantity: Quantity,
        required_bits: u8,
        ceiling: u8,
        excess: u8,
    },

    #[error("Layer {layer}: branch operand {operand} has shape {got:?}, expected {expected:?}")]
    BranchFormatMismatch {
        layer: usize,
        operand: BranchSource,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Layer {layer}: branch operand {operand} was never produced")]
    MissingBranch { layer: usize, operand: BranchSource },

    #[error("Layer {layer}: no activation data observed")]
    ObservationMissing { layer: usize },

    #[error("Layer {layer} ({name}): cannot quantize {tensor}: {source}")]
    Quantization {
        layer: usize,
        name: String,
        tensor: &'static str,
        #[source]
        source: FixedPointError,
    },

    #[error("Fixed-point error: {0}")]
    FixedPoint(#[from] FixedPointError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlanError>;
