//! VPRO Quantization CLI
//!
//! Static fixed-point quantization of a CNN for the VPRO accelerator.
//!
//! # Usage
//!
//! ```bash
//! # Print the per-layer plan for the built-in YOLO-Lite with seeded weights
//! vpro-quant plan --seed 1
//!
//! # Verify the fixed-point executor against the float reference
//! vpro-quant verify -w yolo-lite.weights -i image.f32 --mode chained
//!
//! # Write weight header/source, golden blobs and the plan audit
//! vpro-quant emit -w yolo-lite.weights -i image.f32 --out-dir out
//!
//! # Diff simulator output against golden data
//! vpro-quant compare out/golden sim/output
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vpro_emit::{
    compare_layer_dirs, write_golden, write_input_blobs, write_json, write_plan_json, Endianness,
    WeightHeaderWriter, PLAN_FILE_NAME,
};
use vpro_harness::{PipelineOutput, QuantizationPipeline, VerificationReport};
use vpro_model::{DarknetLoader, FloatTensor, NetworkConfig, NetworkWeights};
use vpro_planner::{QuantizationSettings, VerifyMode};

#[derive(Parser)]
#[command(name = "vpro-quant")]
#[command(version)]
#[command(about = "Static fixed-point quantization for the VPRO CNN accelerator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive and print the per-layer quantization plan
    Plan {
        #[command(flatten)]
        model: ModelArgs,

        /// Also write the plan as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Plan, run the integer executor and compare with the float reference
    Verify {
        #[command(flatten)]
        model: ModelArgs,

        /// Fail when any layer exceeds the divergence tolerance
        #[arg(long)]
        strict: bool,

        /// Write the verification report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Plan, verify and write weight files, golden data and the plan audit
    Emit {
        #[command(flatten)]
        model: ModelArgs,

        /// Output directory
        #[arg(short, long, default_value = "out")]
        out_dir: PathBuf,

        /// Base name of the emitted header/source pair
        #[arg(long, default_value = "weights")]
        basename: String,

        /// Include guard of the header
        #[arg(long, default_value = vpro_emit::DEFAULT_INCLUDE_GUARD)]
        guard: String,

        /// Byte order of the input blobs
        #[arg(long, value_enum, default_value_t = ByteOrder::Little)]
        input_endianness: ByteOrder,
    },

    /// Compare two golden blob directories layer by layer
    Compare {
        /// Reference directory (e.g. emitted golden data)
        expected: PathBuf,

        /// Directory to check (e.g. simulator output)
        actual: PathBuf,

        /// Fail when any value differs by more than this many LSB
        #[arg(long)]
        tolerance: Option<i64>,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Network description JSON (default: built-in YOLO-Lite)
    #[arg(short, long)]
    network: Option<PathBuf>,

    /// Darknet .weights file (default: seeded random weights)
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Seed for random weights
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Raw f32 little-endian CHW input (default: seeded values in [0, 1))
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Seed for the synthetic input
    #[arg(long, default_value = "7")]
    input_seed: u64,

    /// Quantization settings JSON; VPRO_* environment variables overlay it
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Verification mode (overrides settings and VPRO_VERIFY_MODE)
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Every layer starts from the quantized float reference
    PerLayer,
    /// Every layer consumes the previous fixed-point output
    Chained,
}

impl From<Mode> for VerifyMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::PerLayer => VerifyMode::PerLayer,
            Mode::Chained => VerifyMode::Chained,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ByteOrder {
    Little,
    Big,
}

impl From<ByteOrder> for Endianness {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big => Endianness::Big,
        }
    }
}

/// Everything a subcommand needs to run the pipeline
struct Loaded {
    network: NetworkConfig,
    weights: NetworkWeights,
    input: FloatTensor,
    settings: QuantizationSettings,
}

impl ModelArgs {
    fn load(&self) -> Result<Loaded> {
        let network = match &self.network {
            Some(path) => NetworkConfig::from_json_file(path)
                .with_context(|| format!("loading network {}", path.display()))?,
            None => NetworkConfig::yolo_lite(),
        };

        let weights = match &self.weights {
            Some(path) => DarknetLoader::from_file(path)
                .and_then(|loader| loader.load(&network))
                .with_context(|| format!("loading weights {}", path.display()))?,
            None => {
                tracing::info!(seed = self.seed, "using random weights");
                NetworkWeights::random(&network, self.seed)
            }
        };

        let shape = network.input_shape.to_vec();
        let input = match &self.input {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("opening input {}", path.display()))?;
                FloatTensor::read_f32_le(BufReader::new(file), shape)
                    .with_context(|| format!("reading input {}", path.display()))?
            }
            None => FloatTensor::random_unit(shape, self.input_seed),
        };

        let mut settings = match &self.settings {
            Some(path) => QuantizationSettings::from_json_file(path)
                .with_context(|| format!("loading settings {}", path.display()))?,
            None => QuantizationSettings::default(),
        }
        .with_env();
        if let Some(mode) = self.mode {
            settings.verify_mode = mode.into();
        }

        Ok(Loaded {
            network,
            weights,
            input,
            settings,
        })
    }
}

impl Loaded {
    fn run(self) -> Result<(NetworkConfig, PipelineOutput)> {
        let pipeline = QuantizationPipeline::new(self.network.clone(), self.settings)?;
        let output = pipeline.run(&self.weights, &self.input)?;
        Ok((self.network, output))
    }
}

fn print_report(output: &PipelineOutput) {
    println!("{}", output.plan);
    println!("{}", output.report);
}

fn plan(model: &ModelArgs, json: Option<PathBuf>) -> Result<()> {
    let loaded = model.load()?;
    let pipeline = QuantizationPipeline::new(loaded.network, loaded.settings)?;
    let (_, plan) = pipeline.plan(&loaded.weights, &loaded.input)?;
    println!("{plan}");
    if let Some(path) = json {
        write_plan_json(&path, &plan)?;
    }
    Ok(())
}

fn verify(model: &ModelArgs, strict: bool, report: Option<PathBuf>) -> Result<()> {
    let (_, output) = model.load()?.run()?;
    print_report(&output);
    if let Some(path) = report {
        write_json(&path, &output.report)?;
    }
    enforce_tolerance(&output.report, strict)
}

/// Divergences are warnings unless `--strict` is given
fn enforce_tolerance(report: &VerificationReport, strict: bool) -> Result<()> {
    if strict && !report.is_clean() {
        bail!(
            "{} layer(s) exceed the divergence tolerance of {} LSB",
            report.divergences.len(),
            report.tolerance
        );
    }
    Ok(())
}

fn emit(
    model: &ModelArgs,
    out_dir: &Path,
    basename: &str,
    guard: &str,
    endianness: Endianness,
) -> Result<()> {
    let (network, output) = model.load()?.run()?;
    print_report(&output);

    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let header_name = format!("{basename}.h");
    WeightHeaderWriter::new(&header_name).with_guard(guard).write(
        &network,
        &output.plan,
        out_dir.join(&header_name),
        out_dir.join(format!("{basename}.cpp")),
    )?;
    let files = write_golden(out_dir.join("golden"), &output.outputs)?;
    write_input_blobs(out_dir.join("input"), &output.input, endianness)?;
    write_plan_json(out_dir.join(PLAN_FILE_NAME), &output.plan)?;
    write_json(out_dir.join("report.json"), &output.report)?;

    println!(
        "wrote {} layers ({} golden files) to {}",
        output.outputs.len(),
        files,
        out_dir.display()
    );
    Ok(())
}

fn compare(expected: &Path, actual: &Path, tolerance: Option<i64>) -> Result<()> {
    let results = compare_layer_dirs(expected, actual)?;
    for layer in &results {
        println!("{layer}");
    }
    let worst = results.iter().map(|r| r.max_abs_diff).max().unwrap_or(0);
    println!("{} layers compared, max abs diff {}", results.len(), worst);
    if let Some(limit) = tolerance {
        if worst > limit {
            bail!("max abs diff {worst} exceeds tolerance {limit}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vpro_quant=info,vpro_planner=info,vpro_harness=info,vpro_emit=info,vpro_model=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { model, json } => plan(&model, json),
        Commands::Verify { model, strict, report } => verify(&model, strict, report),
        Commands::Emit {
            model,
            out_dir,
            basename,
            guard,
            input_endianness,
        } => emit(&model, &out_dir, &basename, &guard, input_endianness.into()),
        Commands::Compare {
            expected,
            actual,
            tolerance,
        } => compare(&expected, &actual, tolerance),
    }
}
