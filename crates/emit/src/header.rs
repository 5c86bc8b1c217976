//! C++ weight header and source emission
//!
//! One `namespace Layer_<i>` per conv layer carrying the three shifts, the
//! output format and the quantized weights in `[in][out][kh*kw]` order. The
//! header only declares; the source defines.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use vpro_fixed_point::{FixedPointFormat, QuantizedTensor};
use vpro_model::NetworkConfig;
use vpro_planner::{LayerQuantizationPlan, NetworkQuantizationPlan, PlannedLayer};

use crate::constants::{layer_dir_name, DEFAULT_INCLUDE_GUARD};
use crate::error::{EmitError, Result};

/// Rendered header/source pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedWeights {
    pub header: String,
    pub source: String,
}

/// Writes the accelerator weight files for a planned network
#[derive(Debug, Clone)]
pub struct WeightHeaderWriter {
    /// File name the source uses to include the header
    header_name: String,
    guard: String,
}

fn fpf(format: FixedPointFormat) -> String {
    format!("{}.{}", format.integer_bits(), format.fractional_bits())
}

fn shape_str(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    format!("({})", dims.join(", "))
}

fn words(layer: usize, tensor: &QuantizedTensor) -> Result<Vec<i16>> {
    tensor
        .data()
        .iter()
        .map(|&value| i16::try_from(value).map_err(|_| EmitError::WordOverflow { layer, value }))
        .collect()
}

fn raw_range(tensor: &QuantizedTensor) -> String {
    match tensor.raw_range() {
        Some((min, max)) => format!("Min = {min}, Max = {max}"),
        None => "empty".to_string(),
    }
}

impl WeightHeaderWriter {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            guard: DEFAULT_INCLUDE_GUARD.to_string(),
        }
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = guard.into();
        self
    }

    /// Render both files in memory
    pub fn render(
        &self,
        network: &NetworkConfig,
        plan: &NetworkQuantizationPlan,
    ) -> Result<EmittedWeights> {
        if network.num_layers() != plan.layers().len() {
            return Err(EmitError::InvalidLayout(format!(
                "network has {} layers, plan has {}",
                network.num_layers(),
                plan.layers().len()
            )));
        }
        let shapes = network.output_shapes()?;

        let mut header = String::new();
        writeln!(header, "#ifndef {}", self.guard)?;
        writeln!(header, "#define {}", self.guard)?;
        writeln!(header)?;
        writeln!(header, "#include <stdint.h>")?;
        writeln!(header)?;
        writeln!(header, "// Network: {}", plan.network())?;
        writeln!(header, "// Input FPF: {}", fpf(plan.input_format()))?;
        writeln!(header)?;

        let mut source = String::new();
        writeln!(source, "#include \"{}\"", self.header_name)?;
        writeln!(source)?;

        for (index, layer) in plan.layers().iter().enumerate() {
            match layer {
                PlannedLayer::Conv(conv) => {
                    let params = plan
                        .parameters(index)
                        .ok_or(EmitError::MissingParameters { layer: index })?;
                    let input_shape = match index.checked_sub(1) {
                        Some(previous) => shapes[previous],
                        None => network.input_shape,
                    };
                    let block = LayerBlock {
                        plan: conv,
                        input_shape: &input_shape,
                        output_shape: &shapes[index],
                        kernel: &params.kernel,
                        bias: &params.bias,
                    };
                    block.write_declarations(&mut header)?;
                    block.write_definitions(&mut source)?;
                }
                PlannedLayer::Merge(merge) => {
                    writeln!(
                        header,
                        "// {}: residual add of {} and {}, sum >> {}, FPF {}",
                        layer_dir_name(index),
                        merge.lhs,
                        merge.rhs,
                        merge.sum_shift_right,
                        fpf(merge.output)
                    )?;
                    writeln!(header)?;
                }
            }
        }

        writeln!(header, "#endif //{}", self.guard)?;
        Ok(EmittedWeights { header, source })
    }

    /// Render and write the header and source files
    pub fn write<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        network: &NetworkConfig,
        plan: &NetworkQuantizationPlan,
        header_path: P,
        source_path: Q,
    ) -> Result<EmittedWeights> {
        let emitted = self.render(network, plan)?;
        fs::write(header_path.as_ref(), &emitted.header)?;
        fs::write(source_path.as_ref(), &emitted.source)?;
        tracing::info!(
            header = %header_path.as_ref().display(),
            source = %source_path.as_ref().display(),
            layers = plan.layers().len(),
            "wrote weight files"
        );
        Ok(emitted)
    }
}

struct LayerBlock<'a> {
    plan: &'a LayerQuantizationPlan,
    input_shape: &'a [usize],
    output_shape: &'a [usize],
    kernel: &'a QuantizedTensor,
    bias: &'a QuantizedTensor,
}

impl LayerBlock<'_> {
    fn kernel_dims(&self) -> Result<[usize; 3]> {
        self.kernel.shape().try_into().map_err(|_| {
            EmitError::InvalidLayout(format!(
                "layer {} kernel shape {:?} is not [in][out][k]",
                self.plan.index,
                self.kernel.shape()
            ))
        })
    }

    fn write_declarations(&self, out: &mut String) -> Result<()> {
        let p = self.plan;
        let [cin, cout, k] = self.kernel_dims()?;
        writeln!(out, "namespace {} {{", layer_dir_name(p.index))?;
        writeln!(out)?;
        writeln!(out, "\t// Name: {}", p.name)?;
        writeln!(out, "\t// Input-Shape: {}", shape_str(self.input_shape))?;
        writeln!(out, "\t//           FPF: {}", fpf(p.input))?;
        writeln!(out, "\t// Weight-Shape: {}", shape_str(self.kernel.shape()))?;
        writeln!(out, "\t//           FPF: {}", fpf(p.weight))?;
        writeln!(out, "\t//           Data Range: {}", raw_range(self.kernel))?;
        writeln!(out, "\t// Bias-Shape: {}", shape_str(self.bias.shape()))?;
        writeln!(out, "\t//           FPF: {}", fpf(p.bias))?;
        writeln!(out, "\t//           Data Range: {}", raw_range(self.bias))?;
        writeln!(out, "\t// Accumulator FPF: {}", fpf(p.accumulator))?;
        writeln!(out, "\t// Conv-{} Output-Shape: {}", p.activation, shape_str(self.output_shape))?;
        writeln!(out, "\t//           FPF: {}", fpf(p.output))?;
        writeln!(out, "\t//           Value Range: {}", p.post_activation)?;
        writeln!(out)?;
        writeln!(out, "\textern int16_t conv_result_shift_right;\t// = {}", p.mac_shift_right)?;
        writeln!(out, "\textern int16_t bias_store_shift_right;\t// = {}", p.output_store_shift)?;
        writeln!(out, "\textern int16_t bias_load_shift_right;\t// = {}", p.bias_load_shift)?;
        writeln!(out)?;
        writeln!(out, "\textern int16_t result_fractional_bit;")?;
        writeln!(out, "\textern int16_t result_integer_bit;")?;
        writeln!(out)?;
        writeln!(out, "\t//Data Format is (# in channels)(# out channels)(# kernel W*H)")?;
        writeln!(out, "\textern int16_t conv_weights[{cin}][{cout}][{k}];")?;
        writeln!(out)?;
        writeln!(out, "\t//Data Format is (# out channels)")?;
        writeln!(out, "\textern int16_t bias[{}];", self.bias.len())?;
        writeln!(out)?;
        writeln!(out, "}}; // namespace {}", layer_dir_name(p.index))?;
        writeln!(out)?;
        Ok(())
    }

    fn write_definitions(&self, out: &mut String) -> Result<()> {
        let p = self.plan;
        let [cin, cout, k] = self.kernel_dims()?;
        let weights = words(p.index, self.kernel)?;
        let bias = words(p.index, self.bias)?;

        writeln!(out, "namespace {} {{", layer_dir_name(p.index))?;
        writeln!(out)?;
        writeln!(out, "\t// Name: {}", p.name)?;
        writeln!(out, "\tint16_t conv_result_shift_right = {};", p.mac_shift_right)?;
        writeln!(out, "\tint16_t bias_store_shift_right = {};", p.output_store_shift)?;
        writeln!(out, "\tint16_t bias_load_shift_right = {};", p.bias_load_shift)?;
        writeln!(out, "\tint16_t result_fractional_bit = {};", p.output.fractional_bits())?;
        writeln!(out, "\tint16_t result_integer_bit = {};", p.output.integer_bits())?;
        writeln!(out)?;
        writeln!(out, "\t//Coeff fpf: {}", fpf(p.weight))?;
        writeln!(out, "\tint16_t conv_weights[{cin}][{cout}][{k}] = {{")?;
        for input in weights.chunks(cout * k.max(1)) {
            writeln!(out, "\t\t{{")?;
            for taps in input.chunks(k.max(1)) {
                writeln!(out, "\t\t\t{{{}}},", join(taps))?;
            }
            writeln!(out, "\t\t}},")?;
        }
        writeln!(out, "\t}};")?;
        writeln!(out)?;
        writeln!(out, "\t//Bias fpf: {}", fpf(p.bias))?;
        writeln!(out, "\tint16_t bias[{}] = {{{}}};", bias.len(), join(&bias))?;
        writeln!(out)?;
        writeln!(out, "}}; // namespace {}", layer_dir_name(p.index))?;
        writeln!(out)?;
        Ok(())
    }
}

fn join(values: &[i16]) -> String {
    values.iter().map(i16::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpro_fixed_point::ValueRange;
    use vpro_model::{ConvKernel, ConvLayer, LayerConfig, NetworkWeights};
    use vpro_planner::{propagate, LayerObservation, ObservationTable, QuantizationSettings};

    fn planned() -> (NetworkConfig, NetworkQuantizationPlan) {
        let net = NetworkConfig {
            name: "tiny".to_string(),
            input_shape: [1, 2, 2],
            layers: vec![LayerConfig::conv("c0", ConvLayer::new(1, 2, 1))],
        };
        let mut weights = NetworkWeights::new();
        weights
            .insert("c0", ConvKernel::new(1, 2, 1, vec![1.5, -0.5]).unwrap(), vec![0.25, 0.0])
            .unwrap();
        let mut obs = ObservationTable::new();
        obs.insert(
            0,
            LayerObservation::from_ranges(ValueRange::new(-3.0, 3.0), ValueRange::new(-0.3, 3.0)),
        );
        let plan = propagate(
            &net,
            &weights,
            &obs,
            ValueRange::new(0.0, 1.0),
            &QuantizationSettings::default(),
        )
        .unwrap();
        (net, plan)
    }

    #[test]
    fn test_header_declares_layer() {
        let (net, plan) = planned();
        let emitted = WeightHeaderWriter::new("weights.h").render(&net, &plan).unwrap();
        let header = &emitted.header;
        assert!(header.starts_with("#ifndef CNN_WEIGHTS\n#define CNN_WEIGHTS\n"));
        assert!(header.trim_end().ends_with("#endif //CNN_WEIGHTS"));
        assert!(header.contains("namespace Layer_0 {"));
        assert!(header.contains("\textern int16_t conv_weights[1][2][1];"));
        assert!(header.contains("\textern int16_t bias[2];"));
        assert!(header.contains("// Input-Shape: (1, 2, 2)"));
        assert!(header.contains("// Conv-leaky Output-Shape: (2, 2, 2)"));
    }

    #[test]
    fn test_source_defines_shifts_and_data() {
        let (net, plan) = planned();
        let conv = plan.layers()[0].as_conv().unwrap().clone();
        let emitted = WeightHeaderWriter::new("weights.h").render(&net, &plan).unwrap();
        let source = &emitted.source;
        assert!(source.starts_with("#include \"weights.h\""));
        assert!(source.contains(&format!(
            "int16_t conv_result_shift_right = {};",
            conv.mac_shift_right
        )));
        assert!(source.contains(&format!(
            "int16_t bias_load_shift_right = {};",
            conv.bias_load_shift
        )));
        assert!(source.contains(&format!(
            "int16_t bias_store_shift_right = {};",
            conv.output_store_shift
        )));
        assert!(source.contains(&format!(
            "int16_t result_fractional_bit = {};",
            conv.output.fractional_bits()
        )));
        // 1.5 and -0.5 in Q2.14, 0.25 in Q0.16
        assert!(source.contains("\t\t\t{24576},\n\t\t\t{-8192},"));
        assert!(source.contains("int16_t bias[2] = {16384, 0};"));
    }

    #[test]
    fn test_custom_guard_and_files() {
        let (net, plan) = planned();
        let dir = tempfile::tempdir().unwrap();
        let header_path = dir.path().join("yolo.h");
        let source_path = dir.path().join("yolo.cpp");
        WeightHeaderWriter::new("yolo.h")
            .with_guard("YOLO_LITE_WEIGHTS")
            .write(&net, &plan, &header_path, &source_path)
            .unwrap();
        let header = std::fs::read_to_string(header_path).unwrap();
        assert!(header.contains("#define YOLO_LITE_WEIGHTS"));
        assert!(std::fs::read_to_string(source_path).unwrap().contains("namespace Layer_0 {"));
    }

    #[test]
    fn test_layer_count_mismatch() {
        let (mut net, plan) = planned();
        net.layers.push(LayerConfig::conv("c1", ConvLayer::new(2, 1, 1)));
        assert!(matches!(
            WeightHeaderWriter::new("w.h").render(&net, &plan),
            Err(EmitError::InvalidLayout(_))
        ));
    }
}
