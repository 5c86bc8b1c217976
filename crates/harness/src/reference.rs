//! Float reference network
//!
//! A float64 forward pass that quantizes where the deployed network does:
//! weights and biases go through their fixed-point formats, every layer input
//! is re-quantized to the input width with its own range, and the conv + bias
//! result is re-quantized to the accumulator width before pooling and the
//! activation. The recorded ranges drive the planner.

use vpro_fixed_point::QuantizedTensor;
use vpro_model::{
    conv2d, conv_output_shape, pool, BranchSource, ConvLayer, FloatTensor, LayerOp, NetworkConfig,
    WeightSource,
};
use vpro_planner::{ActivationObserver, BitWidths, LayerObservation, PlanError};

use crate::error::{HarnessError, Result};

/// What the reference computed at one layer
#[derive(Debug, Clone)]
pub struct LayerTrace {
    /// Conv + bias (or the residual sum), before pooling and activation
    pub pre_activation: FloatTensor,
    pub output: FloatTensor,
}

/// A completed float forward pass
#[derive(Debug, Clone)]
pub struct FloatReference {
    input: FloatTensor,
    traces: Vec<LayerTrace>,
}

/// Round-trip `values` through the narrowest format of `bits` that holds them
fn requantize(values: &[f64], shape: &[usize], bits: u8) -> Result<Vec<f64>> {
    Ok(QuantizedTensor::quantize(values, shape.to_vec(), bits)?.dequantize())
}

fn chw(shape: &[usize]) -> Result<[usize; 3]> {
    shape.try_into().map_err(|_| HarnessError::ShapeMismatch {
        expected: vec![0, 0, 0],
        got: shape.to_vec(),
    })
}

impl FloatReference {
    /// Run `network` on `input`
    pub fn run<W>(
        network: &NetworkConfig,
        weights: &W,
        input: &FloatTensor,
        widths: &BitWidths,
    ) -> Result<Self>
    where
        W: WeightSource + ?Sized,
    {
        network.validate()?;
        if input.shape() != network.input_shape {
            return Err(HarnessError::ShapeMismatch {
                expected: network.input_shape.to_vec(),
                got: input.shape().to_vec(),
            });
        }

        let mut traces: Vec<LayerTrace> = Vec::with_capacity(network.num_layers());
        for (index, layer) in network.layers.iter().enumerate() {
            let trace = match &layer.op {
                LayerOp::Conv(conv) => {
                    let previous = traces.last().map_or(input, |t| &t.output);
                    conv_layer(&layer.name, conv, previous, weights, widths)?
                }
                LayerOp::Add { lhs, rhs } => {
                    let a = branch(input, &traces, *lhs);
                    let b = branch(input, &traces, *rhs);
                    if a.shape() != b.shape() {
                        return Err(HarnessError::ShapeMismatch {
                            expected: a.shape().to_vec(),
                            got: b.shape().to_vec(),
                        });
                    }
                    let sum = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
                    let sum = FloatTensor::new(a.shape().to_vec(), sum)?;
                    LayerTrace {
                        pre_activation: sum.clone(),
                        output: sum,
                    }
                }
            };
            tracing::debug!(
                layer = index,
                name = %layer.name,
                pre = ?trace.pre_activation.range(),
                post = ?trace.output.range(),
                "reference layer"
            );
            traces.push(trace);
        }

        Ok(Self {
            input: input.clone(),
            traces,
        })
    }

    pub fn input(&self) -> &FloatTensor {
        &self.input
    }

    pub fn num_layers(&self) -> usize {
        self.traces.len()
    }

    pub fn trace(&self, layer: usize) -> Option<&LayerTrace> {
        self.traces.get(layer)
    }

    /// Output of a layer
    pub fn output(&self, layer: usize) -> Option<&FloatTensor> {
        self.traces.get(layer).map(|t| &t.output)
    }
}

fn branch<'a>(
    input: &'a FloatTensor,
    traces: &'a [LayerTrace],
    source: BranchSource,
) -> &'a FloatTensor {
    match source {
        BranchSource::Input => input,
        BranchSource::Layer(j) => &traces[j].output,
    }
}

fn conv_layer<W>(
    name: &str,
    conv: &ConvLayer,
    previous: &FloatTensor,
    weights: &W,
    widths: &BitWidths,
) -> Result<LayerTrace>
where
    W: WeightSource + ?Sized,
{
    let kernel = weights.kernel(name)?;
    let bias = weights.bias(name)?;
    let kernel = requantize(kernel.data(), &kernel.shape(), widths.weight_bits)?;
    let bias = requantize(&bias, &[bias.len()], widths.bias_bits)?;

    let shape = chw(previous.shape())?;
    let input = requantize(previous.data(), previous.shape(), widths.input_bits)?;
    let sums = conv2d(&input, shape, &kernel, conv)?;

    let conv_shape = conv_output_shape(shape, conv);
    let plane = conv_shape[1] * conv_shape[2];
    let biased: Vec<f64> = sums
        .iter()
        .enumerate()
        .map(|(i, s)| s + bias[i / plane])
        .collect();
    let pre = requantize(&biased, &conv_shape, widths.accumulator_bits)?;

    let (pooled, out_shape) = pool(pre.clone(), conv_shape, conv.pool)?;
    let output = pooled.into_iter().map(|v| conv.activation.apply(v)).collect();

    Ok(LayerTrace {
        pre_activation: FloatTensor::new(conv_shape.to_vec(), pre)?,
        output: FloatTensor::new(out_shape.to_vec(), output)?,
    })
}

impl ActivationObserver for FloatReference {
    fn observe(&self, layer: usize) -> vpro_planner::Result<LayerObservation> {
        let trace = self
            .traces
            .get(layer)
            .ok_or(PlanError::ObservationMissing { layer })?;
        let pre = trace
            .pre_activation
            .range()
            .ok_or(PlanError::ObservationMissing { layer })?;
        LayerObservation::with_output(pre, trace.output.clone())
            .ok_or(PlanError::ObservationMissing { layer })
    }

    fn network_input(&self) -> Option<FloatTensor> {
        Some(self.input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpro_fixed_point::ValueRange;
    use vpro_model::{Activation, ConvKernel, LayerConfig, NetworkWeights, Pool};

    fn single_conv(conv: ConvLayer, input_shape: [usize; 3]) -> NetworkConfig {
        NetworkConfig {
            name: "single".to_string(),
            input_shape,
            layers: vec![LayerConfig::conv("c0", conv)],
        }
    }

    #[test]
    fn test_pool_then_activation() {
        let net = single_conv(ConvLayer::new(1, 1, 1).with_pool(Pool::Max2x2), [1, 2, 2]);
        let mut weights = NetworkWeights::new();
        weights
            .insert("c0", ConvKernel::new(1, 1, 1, vec![1.0]).unwrap(), vec![-3.0])
            .unwrap();
        let input = FloatTensor::new(vec![1, 2, 2], vec![0.5, 1.0, 1.5, 2.0]).unwrap();

        let reference = FloatReference::run(&net, &weights, &input, &BitWidths::default()).unwrap();
        let trace = reference.trace(0).unwrap();
        assert_eq!(trace.pre_activation.data(), &[-2.5, -2.0, -1.5, -1.0]);
        // max(-1.0) then leaky
        assert_eq!(trace.output.shape(), &[1, 1, 1]);
        assert!((trace.output.data()[0] + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_observer_ranges() {
        let net = single_conv(
            ConvLayer::new(1, 1, 1).with_activation(Activation::Relu6),
            [1, 1, 3],
        );
        let mut weights = NetworkWeights::new();
        weights
            .insert("c0", ConvKernel::new(1, 1, 1, vec![2.0]).unwrap(), vec![0.0])
            .unwrap();
        let input = FloatTensor::new(vec![1, 1, 3], vec![-1.0, 1.0, 3.5]).unwrap();

        let reference = FloatReference::run(&net, &weights, &input, &BitWidths::default()).unwrap();
        let obs = reference.observe(0).unwrap();
        assert_eq!(obs.pre_activation, ValueRange::new(-2.0, 7.0));
        assert_eq!(obs.post_activation, ValueRange::new(0.0, 6.0));
        assert!(obs.output.is_some());
        assert!(matches!(
            reference.observe(1),
            Err(PlanError::ObservationMissing { layer: 1 })
        ));
        assert_eq!(reference.network_input().unwrap(), input);
    }

    #[test]
    fn test_weights_are_quantized() {
        // 1/3 is not representable; the reference must use the Q0.16 value
        let linear = ConvLayer::new(1, 1, 1).with_activation(Activation::Linear);
        let net = single_conv(linear, [1, 1, 1]);
        let mut weights = NetworkWeights::new();
        weights
            .insert("c0", ConvKernel::new(1, 1, 1, vec![1.0 / 3.0]).unwrap(), vec![0.0])
            .unwrap();
        let input = FloatTensor::new(vec![1, 1, 1], vec![0.5]).unwrap();
        let reference = FloatReference::run(&net, &weights, &input, &BitWidths::default()).unwrap();
        let quantized_weight = (1.0f64 / 3.0 * 65536.0).round() / 65536.0;
        let expected = 0.5 * quantized_weight;
        assert!((reference.output(0).unwrap().data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_input_shape_checked() {
        let net = single_conv(ConvLayer::new(1, 1, 1), [1, 2, 2]);
        let weights = NetworkWeights::random(&net, 1);
        let input = FloatTensor::zeros(vec![1, 3, 3]);
        assert!(matches!(
            FloatReference::run(&net, &weights, &input, &BitWidths::default()),
            Err(HarnessError::ShapeMismatch { .. })
        ));
    }
}
