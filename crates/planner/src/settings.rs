//! Quantization settings

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use vpro_fixed_point::{ACCUMULATOR_BITS, MEMORY_WORD_BITS};

use crate::error::{PlanError, Result};

/// How the executor is fed during verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Every layer starts from the quantized float reference input
    #[default]
    PerLayer,
    /// Every layer consumes the previous fixed-point output
    Chained,
}

impl FromStr for VerifyMode {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_layer" => Ok(VerifyMode::PerLayer),
            "chained" => Ok(VerifyMode::Chained),
            other => Err(PlanError::Settings(format!("unknown verify mode \"{other}\""))),
        }
    }
}

/// Total widths per storage class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitWidths {
    #[serde(default = "default_memory_bits")]
    pub weight_bits: u8,

    #[serde(default = "default_memory_bits")]
    pub bias_bits: u8,

    #[serde(default = "default_memory_bits")]
    pub input_bits: u8,

    #[serde(default = "default_accumulator_bits")]
    pub accumulator_bits: u8,

    #[serde(default = "default_memory_bits")]
    pub output_bits: u8,
}

fn default_memory_bits() -> u8 { MEMORY_WORD_BITS }
fn default_accumulator_bits() -> u8 { ACCUMULATOR_BITS }
fn default_tolerance() -> u32 { 10 }

impl Default for BitWidths {
    fn default() -> Self {
        Self {
            weight_bits: MEMORY_WORD_BITS,
            bias_bits: MEMORY_WORD_BITS,
            input_bits: MEMORY_WORD_BITS,
            accumulator_bits: ACCUMULATOR_BITS,
            output_bits: MEMORY_WORD_BITS,
        }
    }
}

impl BitWidths {
    /// Check every width against the hardware storage ceilings
    pub fn validate(&self) -> Result<()> {
        let classes = [
            ("weight_bits", self.weight_bits, MEMORY_WORD_BITS),
            ("bias_bits", self.bias_bits, MEMORY_WORD_BITS),
            ("input_bits", self.input_bits, MEMORY_WORD_BITS),
            ("accumulator_bits", self.accumulator_bits, ACCUMULATOR_BITS),
            ("output_bits", self.output_bits, MEMORY_WORD_BITS),
        ];
        for (name, bits, ceiling) in classes {
            if bits == 0 || bits > ceiling {
                return Err(PlanError::Settings(format!(
                    "{name} = {bits} must be between 1 and {ceiling}"
                )));
            }
        }
        Ok(())
    }
}

/// Extra integer bits for one layer, in place of per-name patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerOverride {
    pub layer: usize,

    #[serde(default)]
    pub extra_accumulator_integer_bits: u8,

    #[serde(default)]
    pub extra_output_integer_bits: u8,
}

/// Everything the planner and verifier can be configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSettings {
    #[serde(default)]
    pub widths: BitWidths,

    /// Max tolerated executor/reference difference, in output LSB
    #[serde(default = "default_tolerance")]
    pub divergence_tolerance: u32,

    #[serde(default)]
    pub verify_mode: VerifyMode,

    #[serde(default)]
    pub overrides: Vec<LayerOverride>,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            widths: BitWidths::default(),
            divergence_tolerance: default_tolerance(),
            verify_mode: VerifyMode::default(),
            overrides: Vec::new(),
        }
    }
}

impl QuantizationSettings {
    /// Load settings from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with `VPRO_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `VPRO_*` environment variables; unparsable values are ignored
    pub fn with_env(mut self) -> Self {
        if let Ok(tol) = std::env::var("VPRO_DIVERGENCE_TOLERANCE") {
            if let Ok(t) = tol.parse() {
                self.divergence_tolerance = t;
            }
        }

        if let Ok(mode) = std::env::var("VPRO_VERIFY_MODE") {
            if let Ok(m) = mode.parse() {
                self.verify_mode = m;
            }
        }

        if let Ok(bits) = std::env::var("VPRO_WEIGHT_BITS") {
            if let Ok(b) = bits.parse() {
                self.widths.weight_bits = b;
            }
        }

        if let Ok(bits) = std::env::var("VPRO_OUTPUT_BITS") {
            if let Ok(b) = bits.parse() {
                self.widths.output_bits = b;
            }
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        self.widths.validate()?;
        for (i, o) in self.overrides.iter().enumerate() {
            if self.overrides[..i].iter().any(|prev| prev.layer == o.layer) {
                return Err(PlanError::Settings(format!(
                    "layer {} has more than one override",
                    o.layer
                )));
            }
        }
        Ok(())
    }

    /// Override for `layer`, all zeros when none is configured
    pub fn override_for(&self, layer: usize) -> LayerOverride {
        self.overrides
            .iter()
            .find(|o| o.layer == layer)
            .copied()
            .unwrap_or(LayerOverride {
                layer,
                ..LayerOverride::default()
            })
    }
}
