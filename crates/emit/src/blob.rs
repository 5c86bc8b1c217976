//! Raw i16 blob files
//!
//! Golden layer outputs are written one file per channel under
//! `Layer_<i>/channel_<c>.bin`, big-endian. Network inputs are written as
//! `input_<c>.bin` in a configurable byte order.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;
use vpro_fixed_point::QuantizedTensor;

use crate::constants::{
    channel_file_name, input_file_name, layer_dir_name, parse_layer_dir, Endianness, BLOB_EXTENSION,
    CHANNEL_FILE_PREFIX,
};
use crate::error::{EmitError, Result};

fn channel_count(tensor: &QuantizedTensor) -> usize {
    tensor.shape().first().copied().unwrap_or(0)
}

fn write_words<W: Write>(
    writer: &mut W,
    layer: usize,
    words: &[i32],
    endianness: Endianness,
) -> Result<()> {
    for &value in words {
        let word = i16::try_from(value).map_err(|_| EmitError::WordOverflow { layer, value })?;
        match endianness {
            Endianness::Little => writer.write_i16::<LittleEndian>(word)?,
            Endianness::Big => writer.write_i16::<BigEndian>(word)?,
        }
    }
    Ok(())
}

fn write_channels<F>(
    dir: &Path,
    layer: usize,
    tensor: &QuantizedTensor,
    endianness: Endianness,
    name: F,
) -> Result<Vec<PathBuf>>
where
    F: Fn(usize) -> String,
{
    fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(channel_count(tensor));
    for c in 0..channel_count(tensor) {
        let words = tensor
            .channel(c)
            .ok_or_else(|| EmitError::InvalidLayout(format!("layer {layer} has no channel {c}")))?;
        let path = dir.join(name(c));
        let mut writer = BufWriter::new(File::create(&path)?);
        write_words(&mut writer, layer, words, endianness)?;
        writer.flush()?;
        paths.push(path);
    }
    Ok(paths)
}

/// Write one layer's golden output, one big-endian file per channel
pub fn write_layer_blobs<P: AsRef<Path>>(
    root: P,
    layer: usize,
    output: &QuantizedTensor,
) -> Result<Vec<PathBuf>> {
    let dir = root.as_ref().join(layer_dir_name(layer));
    write_channels(&dir, layer, output, Endianness::Big, channel_file_name)
}

/// Write golden outputs for every layer; returns the number of files
pub fn write_golden<P: AsRef<Path>>(root: P, outputs: &[QuantizedTensor]) -> Result<usize> {
    let mut files = 0;
    for (layer, output) in outputs.iter().enumerate() {
        files += write_layer_blobs(root.as_ref(), layer, output)?.len();
    }
    tracing::info!(
        dir = %root.as_ref().display(),
        layers = outputs.len(),
        files,
        "wrote golden data"
    );
    Ok(files)
}

/// Write the quantized network input, one file per channel
pub fn write_input_blobs<P: AsRef<Path>>(
    dir: P,
    input: &QuantizedTensor,
    endianness: Endianness,
) -> Result<Vec<PathBuf>> {
    write_channels(dir.as_ref(), 0, input, endianness, input_file_name)
}

/// Read a raw i16 blob
pub fn read_channel_blob<P: AsRef<Path>>(path: P, endianness: Endianness) -> Result<Vec<i16>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path.as_ref())?).read_to_end(&mut bytes)?;
    if bytes.len() % 2 != 0 {
        return Err(EmitError::InvalidLayout(format!(
            "{} has an odd length of {} bytes",
            path.as_ref().display(),
            bytes.len()
        )));
    }
    let mut words = vec![0i16; bytes.len() / 2];
    match endianness {
        Endianness::Little => LittleEndian::read_i16_into(&bytes, &mut words),
        Endianness::Big => BigEndian::read_i16_into(&bytes, &mut words),
    }
    Ok(words)
}

/// Difference between two blob directories at one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerComparison {
    pub layer: usize,
    pub channels: usize,
    pub values: usize,
    pub max_abs_diff: i64,
    pub sum_abs_diff: i64,
    /// Values that differ at all
    pub mismatched: usize,
}

impl LayerComparison {
    pub fn is_exact(&self) -> bool {
        self.mismatched == 0
    }
}

impl std::fmt::Display for LayerComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<10} {:>4} ch {:>8} values  max {:>6}  sum {:>10}  mismatched {}",
            layer_dir_name(self.layer),
            self.channels,
            self.values,
            self.max_abs_diff,
            self.sum_abs_diff,
            self.mismatched
        )
    }
}

fn layer_dirs(root: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(layer) = entry.file_name().to_str().and_then(parse_layer_dir) {
            dirs.push((layer, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn channel_files(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<(usize, String)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let index = name
            .strip_prefix(CHANNEL_FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(BLOB_EXTENSION))
            .and_then(|rest| rest.strip_suffix('.'))
            .and_then(|c| c.parse::<usize>().ok());
        if let Some(index) = index {
            names.push((index, name));
        }
    }
    names.sort();
    Ok(names.into_iter().map(|(_, name)| name).collect())
}

/// Compare every `Layer_<i>` directory of `expected` with its counterpart
/// in `actual` (both big-endian)
pub fn compare_layer_dirs<P: AsRef<Path>, Q: AsRef<Path>>(
    expected: P,
    actual: Q,
) -> Result<Vec<LayerComparison>> {
    let mut results = Vec::new();
    for (layer, dir) in layer_dirs(expected.as_ref())? {
        let other = actual.as_ref().join(layer_dir_name(layer));
        if !other.is_dir() {
            return Err(EmitError::InvalidLayout(format!("{} is missing", other.display())));
        }

        let mut comparison = LayerComparison {
            layer,
            channels: 0,
            values: 0,
            max_abs_diff: 0,
            sum_abs_diff: 0,
            mismatched: 0,
        };
        for name in channel_files(&dir)? {
            let want = read_channel_blob(dir.join(&name), Endianness::Big)?;
            let got = read_channel_blob(other.join(&name), Endianness::Big)?;
            if want.len() != got.len() {
                return Err(EmitError::InvalidLayout(format!(
                    "{}/{name}: {} values, expected {}",
                    layer_dir_name(layer),
                    got.len(),
                    want.len()
                )));
            }
            for (&a, &b) in want.iter().zip(&got) {
                let diff = (a as i64 - b as i64).abs();
                comparison.max_abs_diff = comparison.max_abs_diff.max(diff);
                comparison.sum_abs_diff += diff;
                comparison.mismatched += usize::from(diff != 0);
            }
            comparison.channels += 1;
            comparison.values += want.len();
        }
        tracing::debug!(layer, max_abs_diff = comparison.max_abs_diff, "compared layer");
        results.push(comparison);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpro_fixed_point::FixedPointFormat;

    fn tensor(shape: Vec<usize>, data: Vec<i32>) -> QuantizedTensor {
        QuantizedTensor::from_raw(shape, FixedPointFormat::new(8, 8).unwrap(), data).unwrap()
    }

    #[test]
    fn test_golden_files_are_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let out = tensor(vec![2, 1, 2], vec![1, -2, 258, 0]);
        let paths = write_layer_blobs(dir.path(), 3, &out).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("Layer_3/channel_0.bin"));

        let bytes = fs::read(&paths[0]).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0xFF, 0xFE]);
        assert_eq!(read_channel_blob(&paths[1], Endianness::Big).unwrap(), vec![258, 0]);
    }

    #[test]
    fn test_input_blobs_little_endian_default() {
        let dir = tempfile::tempdir().unwrap();
        let input = tensor(vec![1, 1, 2], vec![1, 258]);
        let paths = write_input_blobs(dir.path(), &input, Endianness::default()).unwrap();
        assert!(paths[0].ends_with("input_0.bin"));
        assert_eq!(fs::read(&paths[0]).unwrap(), vec![0x01, 0x00, 0x02, 0x01]);

        let big = write_input_blobs(dir.path(), &input, Endianness::Big).unwrap();
        assert_eq!(read_channel_blob(&big[0], Endianness::Big).unwrap(), vec![1, 258]);
    }

    #[test]
    fn test_compare_directories() {
        let golden = tempfile::tempdir().unwrap();
        let sim = tempfile::tempdir().unwrap();
        let a = vec![
            tensor(vec![2, 1, 2], vec![1, 2, 3, 4]),
            tensor(vec![1, 1, 3], vec![10, 20, 30]),
        ];
        let b = vec![
            tensor(vec![2, 1, 2], vec![1, 2, 3, 4]),
            tensor(vec![1, 1, 3], vec![10, 25, 27]),
        ];
        assert_eq!(write_golden(golden.path(), &a).unwrap(), 3);
        write_golden(sim.path(), &b).unwrap();

        let results = compare_layer_dirs(golden.path(), sim.path()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_exact());
        assert_eq!(results[0].channels, 2);
        assert_eq!(results[1].max_abs_diff, 5);
        assert_eq!(results[1].sum_abs_diff, 8);
        assert_eq!(results[1].mismatched, 2);
    }

    #[test]
    fn test_missing_layer_dir() {
        let golden = tempfile::tempdir().unwrap();
        let sim = tempfile::tempdir().unwrap();
        write_golden(golden.path(), &[tensor(vec![1, 1, 1], vec![1])]).unwrap();
        assert!(matches!(
            compare_layer_dirs(golden.path(), sim.path()),
            Err(EmitError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_word_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let format = FixedPointFormat::new(24, 0).unwrap();
        let wide = QuantizedTensor::from_raw(vec![1, 1, 1], format, vec![40000]).unwrap();
        assert!(matches!(
            write_layer_blobs(dir.path(), 0, &wide),
            Err(EmitError::WordOverflow { value: 40000, .. })
        ));
    }

    #[test]
    fn test_odd_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(
            read_channel_blob(&path, Endianness::Little),
            Err(EmitError::InvalidLayout(_))
        ));
    }
}
