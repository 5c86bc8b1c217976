//! Float tensors

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use vpro_fixed_point::ValueRange;

use crate::error::{ModelError, Result};

/// A dense row-major f64 tensor (CHW for activations)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloatTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl FloatTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::InvalidShape {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Seeded synthetic input, uniform in `[0, 1)`
    pub fn random_unit(shape: Vec<usize>, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(0.0..1.0)).collect();
        Self { shape, data }
    }

    /// Read raw little-endian f32 values
    pub fn read_f32_le<R: Read>(mut reader: R, shape: Vec<usize>) -> Result<Self> {
        let len: usize = shape.iter().product();
        let mut values = vec![0f32; len];
        reader.read_f32_into::<LittleEndian>(&mut values)?;
        Self::new(shape, values.into_iter().map(f64::from).collect())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Observed min/max, `None` when empty
    pub fn range(&self) -> Option<ValueRange> {
        ValueRange::of(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_checked() {
        assert!(FloatTensor::new(vec![2, 2], vec![0.0; 3]).is_err());
        let t = FloatTensor::new(vec![1, 2, 2], vec![0.5, -1.0, 2.0, 0.0]).unwrap();
        assert_eq!(t.range().unwrap(), ValueRange::new(-1.0, 2.0));
    }

    #[test]
    fn test_random_unit_deterministic() {
        let a = FloatTensor::random_unit(vec![3, 4, 4], 7);
        let b = FloatTensor::random_unit(vec![3, 4, 4], 7);
        assert_eq!(a, b);
        let range = a.range().unwrap();
        assert!(range.min >= 0.0 && range.max < 1.0);
    }

    #[test]
    fn test_read_f32_le() {
        let mut bytes = Vec::new();
        for v in [1.5f32, -2.0, 0.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let t = FloatTensor::read_f32_le(bytes.as_slice(), vec![3]).unwrap();
        assert_eq!(t.data(), &[1.5, -2.0, 0.25]);
        assert!(FloatTensor::read_f32_le(bytes.as_slice(), vec![4]).is_err());
    }
}
