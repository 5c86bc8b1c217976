//! Convolution and pooling geometry shared by the float and integer paths
//!
//! Tensors are CHW row-major. Kernels are `[in][out][kh * kw]`. Padding
//! follows TensorFlow: SAME pads `total = max((out - 1) * stride + k - in, 0)`
//! with `total / 2` before and the rest after.

use std::ops::{AddAssign, Mul};

use crate::config::{ConvLayer, Padding, Pool};
use crate::error::{ModelError, Result};

/// Output length and leading pad along one spatial axis
pub fn conv_axis(input: usize, kernel: usize, stride: usize, padding: Padding) -> (usize, usize) {
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
            (out, total / 2)
        }
        Padding::Valid if input < kernel => (0, 0),
        Padding::Valid => ((input - kernel) / stride + 1, 0),
    }
}

/// CHW shape after the convolution (before pooling)
pub fn conv_output_shape(input: [usize; 3], conv: &ConvLayer) -> [usize; 3] {
    let (oh, _) = conv_axis(input[1], conv.kernel[0], conv.stride, conv.padding);
    let (ow, _) = conv_axis(input[2], conv.kernel[1], conv.stride, conv.padding);
    [conv.out_channels, oh, ow]
}

/// CHW shape after pooling
pub fn pool_output_shape(input: [usize; 3], pool: Pool) -> [usize; 3] {
    match pool {
        Pool::None => input,
        Pool::Max2x2 => [input[0], input[1].div_ceil(2), input[2].div_ceil(2)],
    }
}

fn check_len(expected: &[usize], got: usize) -> Result<()> {
    if expected.iter().product::<usize>() != got {
        return Err(ModelError::InvalidShape {
            expected: expected.to_vec(),
            got: vec![got],
        });
    }
    Ok(())
}

/// 2-D convolution without bias.
///
/// Generic over the element type so the float reference (`f64`) and the
/// integer executor (`i64` accumulation) walk the exact same windows.
pub fn conv2d<T>(
    input: &[T],
    input_shape: [usize; 3],
    kernel: &[T],
    conv: &ConvLayer,
) -> Result<Vec<T>>
where
    T: Copy + Default + AddAssign + Mul<Output = T>,
{
    check_len(&input_shape, input.len())?;
    check_len(&[conv.in_channels, conv.out_channels, conv.kernel_elements()], kernel.len())?;
    if input_shape[0] != conv.in_channels {
        return Err(ModelError::InvalidShape {
            expected: vec![conv.in_channels],
            got: vec![input_shape[0]],
        });
    }

    let [cin, ih, iw] = input_shape;
    let [kh, kw] = conv.kernel;
    let cout = conv.out_channels;
    let (oh, pad_top) = conv_axis(ih, kh, conv.stride, conv.padding);
    let (ow, pad_left) = conv_axis(iw, kw, conv.stride, conv.padding);

    let mut output = vec![T::default(); cout * oh * ow];
    for oc in 0..cout {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = T::default();
                for ic in 0..cin {
                    let plane = &input[ic * ih * iw..(ic + 1) * ih * iw];
                    let taps = &kernel[(ic * cout + oc) * kh * kw..(ic * cout + oc + 1) * kh * kw];
                    for ky in 0..kh {
                        let Some(iy) = (oy * conv.stride + ky).checked_sub(pad_top) else {
                            continue;
                        };
                        if iy >= ih {
                            continue;
                        }
                        for kx in 0..kw {
                            let Some(ix) = (ox * conv.stride + kx).checked_sub(pad_left) else {
                                continue;
                            };
                            if ix >= iw {
                                continue;
                            }
                            acc += plane[iy * iw + ix] * taps[ky * kw + kx];
                        }
                    }
                }
                output[(oc * oh + oy) * ow + ox] = acc;
            }
        }
    }
    Ok(output)
}

/// 2x2 stride-2 max pooling with SAME padding; padded cells never win
pub fn max_pool_2x2<T>(input: &[T], shape: [usize; 3]) -> Result<(Vec<T>, [usize; 3])>
where
    T: Copy + PartialOrd,
{
    check_len(&shape, input.len())?;
    let [c, h, w] = shape;
    let out_shape = pool_output_shape(shape, Pool::Max2x2);
    let [_, oh, ow] = out_shape;

    let mut output = Vec::with_capacity(c * oh * ow);
    for ch in 0..c {
        let plane = &input[ch * h * w..(ch + 1) * h * w];
        for oy in 0..oh {
            for ox in 0..ow {
                let mut best = plane[(2 * oy) * w + 2 * ox];
                for (dy, dx) in [(0, 1), (1, 0), (1, 1)] {
                    let (y, x) = (2 * oy + dy, 2 * ox + dx);
                    if y < h && x < w && plane[y * w + x] > best {
                        best = plane[y * w + x];
                    }
                }
                output.push(best);
            }
        }
    }
    Ok((output, out_shape))
}

/// Apply `pool` to a CHW tensor
pub fn pool<T>(input: Vec<T>, shape: [usize; 3], pool: Pool) -> Result<(Vec<T>, [usize; 3])>
where
    T: Copy + PartialOrd,
{
    match pool {
        Pool::None => {
            check_len(&shape, input.len())?;
            Ok((input, shape))
        }
        Pool::Max2x2 => max_pool_2x2(&input, shape),
    }
}
