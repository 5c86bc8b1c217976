//! JSON audit output

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use vpro_planner::NetworkQuantizationPlan;

use crate::error::Result;

/// Pretty-print any serializable record to `path`
pub fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Dump the plan for audit
pub fn write_plan_json<P: AsRef<Path>>(path: P, plan: &NetworkQuantizationPlan) -> Result<()> {
    write_json(path.as_ref(), plan)?;
    tracing::info!(path = %path.as_ref().display(), "wrote plan");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpro_fixed_point::ValueRange;
    use vpro_model::{ConvKernel, ConvLayer, LayerConfig, NetworkConfig, NetworkWeights};
    use vpro_planner::{propagate, LayerObservation, ObservationTable, QuantizationSettings};

    #[test]
    fn test_plan_json_is_readable() {
        let net = NetworkConfig {
            name: "audit".to_string(),
            input_shape: [1, 1, 1],
            layers: vec![LayerConfig::conv("c0", ConvLayer::new(1, 1, 1))],
        };
        let mut weights = NetworkWeights::new();
        weights
            .insert("c0", ConvKernel::new(1, 1, 1, vec![0.5]).unwrap(), vec![0.0])
            .unwrap();
        let mut obs = ObservationTable::new();
        obs.insert(
            0,
            LayerObservation::from_ranges(ValueRange::new(0.0, 0.5), ValueRange::new(0.0, 0.5)),
        );
        let settings = QuantizationSettings::default();
        let plan = propagate(&net, &weights, &obs, ValueRange::new(0.0, 1.0), &settings).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        write_plan_json(&path, &plan).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["network"], "audit");
        assert_eq!(json["layers"][0]["kind"], "conv");
        assert_eq!(json["layers"][0]["name"], "c0");
    }
}
