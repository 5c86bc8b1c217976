//! Darknet `.weights` loading
//!
//! The file is a flat array of little-endian f32. The first four values are a
//! header. Each conv layer then stores its bias `[out]` followed by its kernel
//! `(out, in, kh, kw)`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{LayerOp, NetworkConfig};
use crate::error::{ModelError, Result};
use crate::weights::{ConvKernel, NetworkWeights};

/// Header values preceding the parameters
const HEADER_VALUES: usize = 4;

/// Load conv weights from a Darknet weight file
pub struct DarknetLoader {
    values: Vec<f32>,
}

impl DarknetLoader {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let count = bytes.len() / 4;
        if bytes.len() % 4 != 0 {
            tracing::warn!(
                trailing = bytes.len() % 4,
                "weight file length is not a multiple of 4, ignoring trailing bytes"
            );
        }
        if count < HEADER_VALUES {
            return Err(ModelError::UnexpectedEof {
                expected: HEADER_VALUES,
                got: count,
            });
        }

        let mut values = vec![0f32; count];
        LittleEndian::read_f32_into(&bytes[..count * 4], &mut values);
        values.drain(..HEADER_VALUES);
        Ok(Self { values })
    }

    /// Number of parameter values after the header
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slice the parameters into the conv layers of `network`, in order
    pub fn load(&self, network: &NetworkConfig) -> Result<NetworkWeights> {
        let mut weights = NetworkWeights::new();
        let mut ptr = 0usize;

        for layer in &network.layers {
            let LayerOp::Conv(conv) = &layer.op else {
                continue;
            };
            let bias = self.take(&mut ptr, conv.out_channels)?;
            let kernel = self.take(&mut ptr, conv.weight_count())?;
            let kernel = ConvKernel::from_out_major(
                conv.in_channels,
                conv.out_channels,
                conv.kernel_elements(),
                &kernel,
            )?;
            weights.insert(layer.name.clone(), kernel, bias)?;
        }

        tracing::info!(values = ptr, layers = weights.len(), "loaded darknet weights");
        if ptr < self.values.len() {
            tracing::warn!(
                unused = self.values.len() - ptr,
                "weight file has values past the last layer"
            );
        }
        Ok(weights)
    }

    fn take(&self, ptr: &mut usize, count: usize) -> Result<Vec<f64>> {
        let end = *ptr + count;
        if end > self.values.len() {
            return Err(ModelError::UnexpectedEof {
                expected: end,
                got: self.values.len(),
            });
        }
        let out = self.values[*ptr..end].iter().map(|&v| f64::from(v)).collect();
        *ptr = end;
        Ok(out)
    }
}
