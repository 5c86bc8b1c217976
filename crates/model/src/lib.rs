//! VPRO Model Description
//!
//! Network topology, float tensors and weight sources consumed by the
//! quantization planner. Conv and pool geometry lives here so the float
//! reference and the integer executor share it.

mod config;
mod error;
mod loader;
mod ops;
mod tensor;
mod weights;

pub use config::{
    Activation, BranchSource, ConvLayer, LayerConfig, LayerOp, NetworkConfig, Padding, Pool,
    LEAKY_SLOPE, RELU6_CEILING,
};
pub use error::{ModelError, Result};
pub use loader::DarknetLoader;
pub use ops::{conv2d, conv_axis, conv_output_shape, max_pool_2x2, pool, pool_output_shape};
pub use tensor::FloatTensor;
pub use weights::{ConvKernel, LayerWeights, NetworkWeights, WeightSource};
