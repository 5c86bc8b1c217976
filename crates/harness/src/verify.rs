//! Fixed vs float verification

use serde::Serialize;
use vpro_fixed_point::{to_fixed, FixedPointFormat, QuantizedTensor, ValueRange};
use vpro_model::FloatTensor;

use crate::error::{HarnessError, Result};

/// Difference between the executor and the float reference at one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerVerification {
    pub index: usize,
    pub name: String,
    pub format: FixedPointFormat,
    /// Largest difference in output LSBs
    pub max_abs_diff: i64,
    pub mean_abs_diff: f64,
    pub fixed_range: Option<ValueRange>,
    pub reference_range: Option<ValueRange>,
}

/// Compare an executor output with the float reference quantized into the
/// same format
pub fn verify_layer(
    index: usize,
    name: &str,
    fixed: &QuantizedTensor,
    reference: &FloatTensor,
) -> Result<LayerVerification> {
    if fixed.shape() != reference.shape() {
        return Err(HarnessError::ShapeMismatch {
            expected: reference.shape().to_vec(),
            got: fixed.shape().to_vec(),
        });
    }

    let format = fixed.format();
    let mut max_abs_diff = 0i64;
    let mut total = 0i64;
    for (&got, &want) in fixed.data().iter().zip(reference.data()) {
        let diff = (got as i64 - to_fixed(want, format)? as i64).abs();
        max_abs_diff = max_abs_diff.max(diff);
        total += diff;
    }
    let mean_abs_diff = if fixed.is_empty() {
        0.0
    } else {
        total as f64 / fixed.len() as f64
    };

    Ok(LayerVerification {
        index,
        name: name.to_string(),
        format,
        max_abs_diff,
        mean_abs_diff,
        fixed_range: fixed.value_range(),
        reference_range: reference.range(),
    })
}

/// A layer whose fixed output drifted past the tolerance. Not an error: the
/// run continues and the divergences are reported together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantizationDivergence {
    pub layer: usize,
    pub name: String,
    pub max_abs_diff: i64,
    pub fixed_range: Option<ValueRange>,
    pub reference_range: Option<ValueRange>,
}

fn fmt_range(range: Option<ValueRange>) -> String {
    range.map_or_else(|| "empty".to_string(), |r| r.to_string())
}

impl std::fmt::Display for QuantizationDivergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "layer {} ({}): max diff {} LSB, fixed {} vs reference {}",
            self.layer,
            self.name,
            self.max_abs_diff,
            fmt_range(self.fixed_range),
            fmt_range(self.reference_range),
        )
    }
}

/// Verification results of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub tolerance: u32,
    pub layers: Vec<LayerVerification>,
    pub divergences: Vec<QuantizationDivergence>,
}

impl VerificationReport {
    pub fn new(tolerance: u32) -> Self {
        Self {
            tolerance,
            layers: Vec::new(),
            divergences: Vec::new(),
        }
    }

    /// Add a layer result, flagging it when it exceeds the tolerance
    pub fn record(&mut self, layer: LayerVerification) {
        if layer.max_abs_diff > self.tolerance as i64 {
            let divergence = QuantizationDivergence {
                layer: layer.index,
                name: layer.name.clone(),
                max_abs_diff: layer.max_abs_diff,
                fixed_range: layer.fixed_range,
                reference_range: layer.reference_range,
            };
            tracing::warn!(%divergence, tolerance = self.tolerance, "quantization divergence");
            self.divergences.push(divergence);
        } else {
            tracing::debug!(
                layer = layer.index,
                max_abs_diff = layer.max_abs_diff,
                mean_abs_diff = layer.mean_abs_diff,
                "layer verified"
            );
        }
        self.layers.push(layer);
    }

    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }

    /// Worst difference over all verified layers
    pub fn max_abs_diff(&self) -> i64 {
        self.layers.iter().map(|l| l.max_abs_diff).max().unwrap_or(0)
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for layer in &self.layers {
            writeln!(
                f,
                "{:>3} {:<12} {:<6} max {:>4} LSB mean {:.3}",
                layer.index,
                layer.name,
                layer.format.to_string(),
                layer.max_abs_diff,
                layer.mean_abs_diff
            )?;
        }
        if self.is_clean() {
            write!(f, "all {} layers within {} LSB", self.layers.len(), self.tolerance)
        } else {
            writeln!(
                f,
                "{} of {} layers exceed {} LSB:",
                self.divergences.len(),
                self.layers.len(),
                self.tolerance
            )?;
            for divergence in &self.divergences {
                writeln!(f, "  {divergence}")?;
            }
            Ok(())
        }
    }
}
