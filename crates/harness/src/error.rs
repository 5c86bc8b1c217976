//! Harness error types

use thiserror::Error;
use vpro_fixed_point::{FixedPointError, FixedPointFormat};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Planning error: {0}")]
    Plan(#[from] vpro_planner::PlanError),

    #[error("Model error: {0}")]
    Model(#[from] vpro_model::ModelError),

    #[error("Fixed-point error: {0}")]
    FixedPoint(#[from] FixedPointError),

    #[error("Layer {layer}: overflow at {stage}: {source}")]
    Overflow {
        layer: usize,
        stage: &'static str,
        #[source]
        source: FixedPointError,
    },

    #[error("Layer {layer}: {tensor} is {got}, plan expects {expected}")]
    FormatMismatch {
        layer: usize,
        tensor: &'static str,
        expected: FixedPointFormat,
        got: FixedPointFormat,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
