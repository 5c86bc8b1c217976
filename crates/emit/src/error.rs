//! Emitter error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Formatting error")]
    Format(#[from] std::fmt::Error),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Layer {layer}: value {value} does not fit a 16-bit word")]
    WordOverflow { layer: usize, value: i32 },

    #[error("Layer {layer} has no quantized parameters in the plan")]
    MissingParameters { layer: usize },

    #[error("Model error: {0}")]
    Model(#[from] vpro_model::ModelError),
}

pub type Result<T> = std::result::Result<T, EmitError>;
