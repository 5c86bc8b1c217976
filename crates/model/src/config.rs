//! CNN network description

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{ModelError, Result};
use crate::ops::{conv_output_shape, pool_output_shape};

/// Negative slope of the leaky ReLU
pub const LEAKY_SLOPE: f64 = 0.1;

/// Upper clamp of relu6
pub const RELU6_CEILING: f64 = 6.0;

/// Nonlinearity applied after the bias add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Leaky,
    Relu6,
    Linear,
}

impl Activation {
    /// Apply in floating point
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Leaky if x < 0.0 => x * LEAKY_SLOPE,
            Activation::Relu6 => x.clamp(0.0, RELU6_CEILING),
            _ => x,
        }
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Activation::Leaky => "leaky",
            Activation::Relu6 => "relu6",
            Activation::Linear => "linear",
        };
        f.write_str(name)
    }
}

/// Pooling after the activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    #[default]
    None,
    /// 2x2 window, stride 2, SAME padding
    Max2x2,
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pool::None => f.write_str("none"),
            Pool::Max2x2 => f.write_str("max2x2"),
        }
    }
}

/// Spatial padding mode (TensorFlow semantics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

/// A convolution + bias + activation + pool stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvLayer {
    pub in_channels: usize,
    pub out_channels: usize,

    /// Kernel height and width
    #[serde(default = "default_kernel")]
    pub kernel: [usize; 2],

    #[serde(default = "default_stride")]
    pub stride: usize,

    #[serde(default)]
    pub padding: Padding,

    #[serde(default)]
    pub activation: Activation,

    #[serde(default)]
    pub pool: Pool,
}

fn default_kernel() -> [usize; 2] { [3, 3] }
fn default_stride() -> usize { 1 }

impl ConvLayer {
    /// Conv with the defaults of the YOLO-Lite stages
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel: [kernel, kernel],
            stride: default_stride(),
            padding: Padding::Same,
            activation: Activation::Leaky,
            pool: Pool::None,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Elements per 2-D kernel (`kh * kw`)
    pub fn kernel_elements(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }

    /// Number of kernel weights
    pub fn weight_count(&self) -> usize {
        self.in_channels * self.out_channels * self.kernel_elements()
    }

    /// Shape after conv and pool for a CHW input
    pub fn output_shape(&self, input: [usize; 3]) -> [usize; 3] {
        pool_output_shape(conv_output_shape(input, self), self.pool)
    }
}

/// Operand of a residual add
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "BranchRef", into = "BranchRef")]
pub enum BranchSource {
    /// The network input
    Input,
    /// Output of an earlier layer
    Layer(usize),
}

impl std::fmt::Display for BranchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchSource::Input => f.write_str("input"),
            BranchSource::Layer(i) => write!(f, "layer {i}"),
        }
    }
}

/// JSON form of a branch operand: a layer index or `"input"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BranchRef {
    Index(usize),
    Name(String),
}

impl TryFrom<BranchRef> for BranchSource {
    type Error = String;

    fn try_from(value: BranchRef) -> std::result::Result<Self, Self::Error> {
        match value {
            BranchRef::Index(i) => Ok(BranchSource::Layer(i)),
            BranchRef::Name(name) if name == "input" => Ok(BranchSource::Input),
            BranchRef::Name(name) => Err(format!(
                "branch operand must be a layer index or \"input\", got \"{name}\""
            )),
        }
    }
}

impl From<BranchSource> for BranchRef {
    fn from(value: BranchSource) -> Self {
        match value {
            BranchSource::Input => BranchRef::Name("input".to_string()),
            BranchSource::Layer(i) => BranchRef::Index(i),
        }
    }
}

/// What a layer computes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerOp {
    Conv(ConvLayer),
    /// Residual add of two earlier tensors
    Add { lhs: BranchSource, rhs: BranchSource },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub op: LayerOp,
}

impl LayerConfig {
    pub fn conv(name: impl Into<String>, conv: ConvLayer) -> Self {
        Self {
            name: name.into(),
            op: LayerOp::Conv(conv),
        }
    }

    pub fn add(name: impl Into<String>, lhs: BranchSource, rhs: BranchSource) -> Self {
        Self {
            name: name.into(),
            op: LayerOp::Add { lhs, rhs },
        }
    }

    pub fn as_conv(&self) -> Option<&ConvLayer> {
        match &self.op {
            LayerOp::Conv(conv) => Some(conv),
            LayerOp::Add { .. } => None,
        }
    }
}

/// An ordered, topologically sorted CNN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Channels, height, width
    pub input_shape: [usize; 3],

    pub layers: Vec<LayerConfig>,
}

fn default_name() -> String { "network".to_string() }

impl NetworkConfig {
    /// Load a network description from JSON
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// The 7-layer YOLO-Lite on a 3x224x224 image
    pub fn yolo_lite() -> Self {
        Self::yolo_lite_for_input(224, 224)
    }

    /// YOLO-Lite topology on a custom image size
    pub fn yolo_lite_for_input(height: usize, width: usize) -> Self {
        let stages: [(usize, usize, usize, Pool, Activation); 7] = [
            (3, 16, 3, Pool::Max2x2, Activation::Leaky),
            (16, 32, 3, Pool::Max2x2, Activation::Leaky),
            (32, 64, 3, Pool::Max2x2, Activation::Leaky),
            (64, 128, 3, Pool::Max2x2, Activation::Leaky),
            (128, 128, 3, Pool::Max2x2, Activation::Leaky),
            (128, 256, 3, Pool::None, Activation::Leaky),
            (256, 125, 1, Pool::None, Activation::Linear),
        ];
        let layers = stages
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, k, pool, act))| {
                LayerConfig::conv(
                    format!("conv{i}"),
                    ConvLayer::new(cin, cout, k).with_pool(pool).with_activation(act),
                )
            })
            .collect();
        Self {
            name: "yolo-lite".to_string(),
            input_shape: [3, height, width],
            layers,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Check channel chaining and that adds only look backwards
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(ModelError::Config("network has no layers".to_string()));
        }
        if self.input_shape.iter().any(|&d| d == 0) {
            return Err(ModelError::Config(format!(
                "input shape {:?} has a zero dimension",
                self.input_shape
            )));
        }

        let mut shapes: Vec<[usize; 3]> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let input = shapes.last().copied().unwrap_or(self.input_shape);
            let shape = match &layer.op {
                LayerOp::Conv(conv) => {
                    if conv.in_channels != input[0] {
                        return Err(ModelError::Config(format!(
                            "layer {} ({}): in_channels {} but previous output has {} channels",
                            i, layer.name, conv.in_channels, input[0]
                        )));
                    }
                    if conv.out_channels == 0 || conv.stride == 0 || conv.kernel_elements() == 0 {
                        return Err(ModelError::Config(format!(
                            "layer {} ({}): channels, kernel and stride must be non-zero",
                            i, layer.name
                        )));
                    }
                    let out = conv.output_shape(input);
                    if out.iter().any(|&d| d == 0) {
                        return Err(ModelError::Config(format!(
                            "layer {} ({}): output shape {:?} is empty",
                            i, layer.name, out
                        )));
                    }
                    out
                }
                LayerOp::Add { lhs, rhs } => {
                    for source in [lhs, rhs] {
                        if let BranchSource::Layer(j) = *source {
                            if j >= i {
                                return Err(ModelError::Config(format!(
                                    "layer {} ({}): add operand {} is not an earlier layer",
                                    i, layer.name, source
                                )));
                            }
                        }
                    }
                    let left = self.branch_shape(*lhs, &shapes);
                    let right = self.branch_shape(*rhs, &shapes);
                    if left != right {
                        return Err(ModelError::Config(format!(
                            "layer {} ({}): add operands have shapes {:?} and {:?}",
                            i, layer.name, left, right
                        )));
                    }
                    left
                }
            };
            shapes.push(shape);
        }
        Ok(())
    }

    fn branch_shape(&self, source: BranchSource, shapes: &[[usize; 3]]) -> [usize; 3] {
        match source {
            BranchSource::Input => self.input_shape,
            BranchSource::Layer(j) => shapes[j],
        }
    }

    /// Static CHW output shape of every layer
    pub fn output_shapes(&self) -> Result<Vec<[usize; 3]>> {
        self.validate()?;
        let mut shapes: Vec<[usize; 3]> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let input = shapes.last().copied().unwrap_or(self.input_shape);
            let shape = match &layer.op {
                LayerOp::Conv(conv) => conv.output_shape(input),
                LayerOp::Add { lhs, .. } => self.branch_shape(*lhs, &shapes),
            };
            shapes.push(shape);
        }
        Ok(shapes)
    }

    /// Layers whose outputs feed a later add
    pub fn branch_sources(&self) -> BTreeSet<BranchSource> {
        self.layers
            .iter()
            .filter_map(|layer| match layer.op {
                LayerOp::Add { lhs, rhs } => Some([lhs, rhs]),
                LayerOp::Conv(_) => None,
            })
            .flatten()
            .collect()
    }
}
