//! VPRO Verification Harness
//!
//! Float reference network, bit-exact integer executor and the pipeline that
//! plans a network and checks the fixed-point result against the float one.

mod error;
mod executor;
mod pipeline;
mod reference;
mod verify;

pub use error::{HarnessError, Result};
pub use executor::{apply_activation, execute_layer, execute_merge, leak_constant, LEAK_SHIFT};
pub use pipeline::{PipelineOutput, QuantizationPipeline};
pub use reference::{FloatReference, LayerTrace};
pub use verify::{verify_layer, LayerVerification, QuantizationDivergence, VerificationReport};
