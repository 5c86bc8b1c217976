//! VPRO Weight/Header Emitter
//!
//! Turns a finished quantization plan into the files the accelerator build
//! consumes: a C++ header/source pair with weights and shifts, per-channel
//! golden blobs for simulator comparison, and a JSON audit of the plan.

mod audit;
mod blob;
mod constants;
mod error;
mod header;

pub use audit::{write_json, write_plan_json};
pub use blob::{
    compare_layer_dirs, read_channel_blob, write_golden, write_input_blobs, write_layer_blobs,
    LayerComparison,
};
pub use constants::*;
pub use error::{EmitError, Result};
pub use header::{EmittedWeights, WeightHeaderWriter};
