//! Model error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Invalid tensor shape: expected {expected:?}, got {got:?}")]
    InvalidShape { expected: Vec<usize>, got: Vec<usize> },

    #[error("Weight file too short: needed {expected} floats, only {got} available")]
    UnexpectedEof { expected: usize, got: usize },

    #[error("Fixed-point error: {0}")]
    FixedPoint(#[from] vpro_fixed_point::FixedPointError),

    #[error("Network config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
