//! File layout constants

/// Include guard of the emitted weight header
pub const DEFAULT_INCLUDE_GUARD: &str = "CNN_WEIGHTS";

/// Per-layer golden directory prefix: `Layer_<i>`
pub const LAYER_DIR_PREFIX: &str = "Layer_";

/// Per-channel golden file prefix: `channel_<c>.bin`
pub const CHANNEL_FILE_PREFIX: &str = "channel_";

/// Network input file prefix: `input_<c>.bin`
pub const INPUT_FILE_PREFIX: &str = "input_";

pub const BLOB_EXTENSION: &str = "bin";

/// Plan audit file written next to the golden data
pub const PLAN_FILE_NAME: &str = "plan.json";

/// Byte order of raw i16 blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Golden layer directory name
pub fn layer_dir_name(layer: usize) -> String {
    format!("{LAYER_DIR_PREFIX}{layer}")
}

pub fn channel_file_name(channel: usize) -> String {
    format!("{CHANNEL_FILE_PREFIX}{channel}.{BLOB_EXTENSION}")
}

pub fn input_file_name(channel: usize) -> String {
    format!("{INPUT_FILE_PREFIX}{channel}.{BLOB_EXTENSION}")
}

/// Layer index of a `Layer_<i>` directory name
pub fn parse_layer_dir(name: &str) -> Option<usize> {
    name.strip_prefix(LAYER_DIR_PREFIX)?.parse().ok()
}
