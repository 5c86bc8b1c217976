//! Convolution weights and weight sources

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{LayerOp, NetworkConfig};
use crate::error::{ModelError, Result};

/// A convolution kernel stored `[in][out][kh * kw]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConvKernel {
    in_channels: usize,
    out_channels: usize,
    kernel_elements: usize,
    data: Vec<f64>,
}

impl ConvKernel {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_elements: usize,
        data: Vec<f64>,
    ) -> Result<Self> {
        let expected = in_channels * out_channels * kernel_elements;
        if data.len() != expected {
            return Err(ModelError::InvalidShape {
                expected: vec![in_channels, out_channels, kernel_elements],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            in_channels,
            out_channels,
            kernel_elements,
            data,
        })
    }

    /// Reorder a Caffe/Darknet `(out, in, kh, kw)` kernel
    pub fn from_out_major(
        in_channels: usize,
        out_channels: usize,
        kernel_elements: usize,
        data: &[f64],
    ) -> Result<Self> {
        let expected = in_channels * out_channels * kernel_elements;
        if data.len() != expected {
            return Err(ModelError::InvalidShape {
                expected: vec![out_channels, in_channels, kernel_elements],
                got: vec![data.len()],
            });
        }
        let mut reordered = vec![0.0; expected];
        for o in 0..out_channels {
            for i in 0..in_channels {
                let src = (o * in_channels + i) * kernel_elements;
                let dst = (i * out_channels + o) * kernel_elements;
                reordered[dst..dst + kernel_elements]
                    .copy_from_slice(&data[src..src + kernel_elements]);
            }
        }
        Self::new(in_channels, out_channels, kernel_elements, reordered)
    }

    /// Weight at (input channel, output channel, kernel element)
    pub fn get(&self, input: usize, output: usize, element: usize) -> f64 {
        self.data[(input * self.out_channels + output) * self.kernel_elements + element]
    }

    /// `[in, out, kh * kw]`
    pub fn shape(&self) -> [usize; 3] {
        [self.in_channels, self.out_channels, self.kernel_elements]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// Named float tensors for each conv layer
pub trait WeightSource {
    /// Kernel of the named layer, `[in][out][kh * kw]`
    fn kernel(&self, layer_name: &str) -> Result<ConvKernel>;

    /// Bias of the named layer, one value per output channel
    fn bias(&self, layer_name: &str) -> Result<Vec<f64>>;
}

/// Kernel and bias of one conv layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub kernel: ConvKernel,
    pub bias: Vec<f64>,
}

/// In-memory weight store keyed by layer name
#[derive(Debug, Clone, Default)]
pub struct NetworkWeights {
    layers: BTreeMap<String, LayerWeights>,
}

impl NetworkWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer, checking the bias length against the kernel
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        kernel: ConvKernel,
        bias: Vec<f64>,
    ) -> Result<()> {
        let out_channels = kernel.shape()[1];
        if bias.len() != out_channels {
            return Err(ModelError::InvalidShape {
                expected: vec![out_channels],
                got: vec![bias.len()],
            });
        }
        self.layers.insert(name.into(), LayerWeights { kernel, bias });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&LayerWeights> {
        self.layers.get(name)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Seeded random weights for every conv layer of `network`
    pub fn random(network: &NetworkConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut weights = Self::new();

        for layer in &network.layers {
            let LayerOp::Conv(conv) = &layer.op else {
                continue;
            };
            // Kaiming-like fan-in scaling
            let fan_in = (conv.in_channels * conv.kernel_elements()) as f64;
            let bound = (2.0 / fan_in).sqrt();
            let data = (0..conv.weight_count())
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            let bias = (0..conv.out_channels)
                .map(|_| rng.gen_range(-0.1..0.1))
                .collect();
            let kernel = ConvKernel {
                in_channels: conv.in_channels,
                out_channels: conv.out_channels,
                kernel_elements: conv.kernel_elements(),
                data,
            };
            weights
                .layers
                .insert(layer.name.clone(), LayerWeights { kernel, bias });
        }
        weights
    }
}

impl WeightSource for NetworkWeights {
    fn kernel(&self, layer_name: &str) -> Result<ConvKernel> {
        self.layers
            .get(layer_name)
            .map(|w| w.kernel.clone())
            .ok_or_else(|| ModelError::MissingTensor(format!("{layer_name}.kernel")))
    }

    fn bias(&self, layer_name: &str) -> Result<Vec<f64>> {
        self.layers
            .get(layer_name)
            .map(|w| w.bias.clone())
            .ok_or_else(|| ModelError::MissingTensor(format!("{layer_name}.bias")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_out_major_reorders() {
        // out=2, in=3, k=1: data[o][i] = 10 * o + i
        let data = [0.0, 1.0, 2.0, 10.0, 11.0, 12.0];
        let kernel = ConvKernel::from_out_major(3, 2, 1, &data).unwrap();
        assert_eq!(kernel.shape(), [3, 2, 1]);
        assert_eq!(kernel.get(2, 1, 0), 12.0);
        assert_eq!(kernel.get(1, 0, 0), 1.0);
        assert_eq!(kernel.data(), &[0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
    }

    #[test]
    fn test_random_weights_seeded() {
        let net = NetworkConfig::yolo_lite();
        let a = NetworkWeights::random(&net, 42);
        let b = NetworkWeights::random(&net, 42);
        assert_eq!(a.len(), 7);
        assert_eq!(a.kernel("conv3").unwrap(), b.kernel("conv3").unwrap());
        assert_eq!(a.kernel("conv0").unwrap().shape(), [3, 16, 9]);
        assert_eq!(a.bias("conv6").unwrap().len(), 125);
    }

    #[test]
    fn test_missing_layer() {
        let weights = NetworkWeights::new();
        assert!(matches!(
            weights.kernel("conv0"),
            Err(ModelError::MissingTensor(_))
        ));
    }

    #[test]
    fn test_insert_checks_bias() {
        let mut weights = NetworkWeights::new();
        let kernel = ConvKernel::new(1, 2, 1, vec![1.0, 2.0]).unwrap();
        assert!(weights.insert("c", kernel.clone(), vec![0.0]).is_err());
        weights.insert("c", kernel, vec![0.0, 0.5]).unwrap();
        assert_eq!(weights.bias("c").unwrap(), vec![0.0, 0.5]);
    }
}
