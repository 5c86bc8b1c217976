//! Quantized tensors

use serde::Serialize;

use crate::error::{FixedPointError, Result};
use crate::fixed::{check_fits, reformat, to_fixed, to_float};
use crate::format::{FixedPointFormat, ValueRange};

/// A tensor of fixed-point values sharing one format.
///
/// Immutable once built; re-quantization produces a new tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuantizedTensor {
    shape: Vec<usize>,
    format: FixedPointFormat,
    data: Vec<i32>,
}

fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn check_shape(shape: &[usize], len: usize) -> Result<()> {
    let expected = element_count(shape);
    if expected != len {
        return Err(FixedPointError::ShapeMismatch { expected, got: len });
    }
    Ok(())
}

impl QuantizedTensor {
    /// Wrap raw integers, checking the shape and that every value fits
    pub fn from_raw(shape: Vec<usize>, format: FixedPointFormat, data: Vec<i32>) -> Result<Self> {
        check_shape(&shape, data.len())?;
        for &v in &data {
            check_fits(v as i64, format)?;
        }
        Ok(Self {
            shape,
            format,
            data,
        })
    }

    /// Quantize with the minimal-integer-bit format of `max_total_bits` width.
    ///
    /// Fails with `PrecisionExceeded` when the dynamic range does not fit even
    /// with zero fractional bits.
    pub fn quantize(values: &[f64], shape: Vec<usize>, max_total_bits: u8) -> Result<Self> {
        check_shape(&shape, values.len())?;
        if let Some(&bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(FixedPointError::NonFiniteValue(bad));
        }
        let range = ValueRange::of(values).ok_or(FixedPointError::EmptyTensor)?;
        let format = FixedPointFormat::for_range(range, max_total_bits)?;
        tracing::trace!(%range, %format, len = values.len(), "quantizing tensor");
        Self::quantize_with_format(values, shape, format)
    }

    /// Quantize into a given format
    pub fn quantize_with_format(
        values: &[f64],
        shape: Vec<usize>,
        format: FixedPointFormat,
    ) -> Result<Self> {
        check_shape(&shape, values.len())?;
        let data = values
            .iter()
            .map(|&v| to_fixed(v, format))
            .collect::<Result<Vec<i32>>>()?;
        Ok(Self {
            shape,
            format,
            data,
        })
    }

    /// Convert every element back to a float
    pub fn dequantize(&self) -> Vec<f64> {
        self.data.iter().map(|&v| to_float(v, self.format)).collect()
    }

    /// New tensor in `to`, shifted element-wise
    pub fn requantize(&self, to: FixedPointFormat) -> Result<Self> {
        let data = self
            .data
            .iter()
            .map(|&v| reformat(v, self.format, to))
            .collect::<Result<Vec<i32>>>()?;
        Ok(Self {
            shape: self.shape.clone(),
            format: to,
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn format(&self) -> FixedPointFormat {
        self.format
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Smallest and largest raw values
    pub fn raw_range(&self) -> Option<(i32, i32)> {
        let lo = *self.data.iter().min()?;
        let hi = *self.data.iter().max()?;
        Some((lo, hi))
    }

    /// Real-valued range of the stored data
    pub fn value_range(&self) -> Option<ValueRange> {
        ValueRange::of_raw(&self.data, self.format)
    }

    /// Slice of one leading-dimension entry (one channel of a CHW tensor)
    pub fn channel(&self, index: usize) -> Option<&[i32]> {
        let channels = *self.shape.first()?;
        if index >= channels {
            return None;
        }
        let stride = self.data.len() / channels;
        Some(&self.data[index * stride..(index + 1) * stride])
    }
}
