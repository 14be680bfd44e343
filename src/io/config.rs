//! JSON scan-definition files.
//!
//! A scan file describes everything `scan run` needs:
//!
//! ```json
//! {
//!   "points": { "sweep": { "kind": "linspace", "start": -1.0, "stop": 1.0, "steps": 41 } },
//!   "settings": { "npasses": 2, "nrepeats": 20 },
//!   "models": [
//!     { "name": "peak", "channel": "pmt", "aggregates": true, "mutates_plot": true,
//!       "fit": { "function": "gaussian", "main_fit": "x0" } }
//!   ],
//!   "recovery": { "channel": "pmt", "threshold": 0.5, "rewind": 2 },
//!   "simulation": { "signals": [
//!     { "channel": "pmt", "function": "gaussian", "params": [1.0, 10.0, 0.2, 0.3], "noise": 0.5 }
//!   ] }
//! }
//! ```
//!
//! Everything is validated while building the [`Scan`]; a bad file fails
//! before any state exists.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::SimulationConfig;
use crate::domain::{CheckGranularity, ScanSettings};
use crate::error::{ScanError, ScanResult};
use crate::fit::FitOverrides;
use crate::math::{lin_space, log_space};
use crate::models::{ModelEntry, ModelRegistry};
use crate::recovery::ThresholdCheck;
use crate::scan::Scan;
use crate::space::PointSpace;

/// Values along one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisDef {
    Values { values: Vec<f64> },
    Linspace { start: f64, stop: f64, steps: usize },
    Logspace { min: f64, max: f64, steps: usize },
}

impl AxisDef {
    pub fn values(&self) -> ScanResult<Vec<f64>> {
        match self {
            AxisDef::Values { values } => Ok(values.clone()),
            AxisDef::Linspace { start, stop, steps } => lin_space(*start, *stop, *steps),
            AxisDef::Logspace { min, max, steps } => log_space(*min, *max, *steps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointsDef {
    /// A 1-D sweep.
    Sweep(AxisDef),
    /// One axis per dimension, outermost first.
    Grid(Vec<AxisDef>),
    Continuous { start: f64, step: f64 },
}

impl PointsDef {
    pub fn to_space(&self) -> ScanResult<PointSpace> {
        match self {
            PointsDef::Sweep(axis) => PointSpace::flat(axis.values()?),
            PointsDef::Grid(axes) => PointSpace::grid(axes.iter().map(AxisDef::values).collect::<ScanResult<_>>()?),
            PointsDef::Continuous { start, step } => PointSpace::continuous(*start, *step),
        }
    }
}

/// Threshold-based recovery with rate-limited reacquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDef {
    #[serde(flatten)]
    pub check: ThresholdCheck,
    #[serde(default)]
    pub granularity: CheckGranularity,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_window_secs() -> f64 {
    60.0
}

impl RecoveryDef {
    pub fn window(&self) -> ScanResult<Duration> {
        Duration::try_from_secs_f64(self.window_secs)
            .map_err(|e| ScanError::config(format!("recovery window_secs: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFile {
    pub points: PointsDef,
    #[serde(default)]
    pub settings: ScanSettings,
    pub models: Vec<ModelEntry>,
    /// Shift applied to the innermost coordinate of every point.
    #[serde(default)]
    pub offset: f64,
    /// Per-model fit overrides layered over the models' fit specs.
    #[serde(default)]
    pub overrides: BTreeMap<String, FitOverrides>,
    #[serde(default)]
    pub recovery: Option<RecoveryDef>,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

impl ScanFile {
    pub fn registry(&self) -> ScanResult<ModelRegistry> {
        let mut registry = ModelRegistry::new();
        for entry in &self.models {
            registry.register(entry.clone())?;
        }
        Ok(registry)
    }

    /// Build the scan described by this file, without recovery.
    pub fn build(&self) -> ScanResult<Scan> {
        if !self.offset.is_finite() {
            return Err(ScanError::config("offset must be finite"));
        }
        let mut scan = Scan::new(self.points.to_space()?, self.settings.clone(), self.registry()?)?;
        if self.offset != 0.0 {
            scan.offset_points(self.offset);
        }
        for (model, overrides) in &self.overrides {
            scan.set_fit_overrides(model, overrides.clone())?;
        }
        if let Some(recovery) = &self.recovery {
            recovery.window()?;
            if !scan.channels().contains(&recovery.check.channel) {
                return Err(ScanError::UnknownChannel(recovery.check.channel.clone()));
            }
        }
        if let Some(sim) = &self.simulation {
            sim.validate()?;
        }
        Ok(scan)
    }
}

pub fn parse_scan_file(text: &str) -> ScanResult<ScanFile> {
    Ok(serde_json::from_str(text)?)
}

pub fn read_scan_file(path: &Path) -> ScanResult<ScanFile> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::FitFunction;

    const GAUSSIAN_SCAN: &str = r#"{
        "points": { "sweep": { "kind": "linspace", "start": -1.0, "stop": 1.0, "steps": 5 } },
        "settings": { "nrepeats": 3 },
        "models": [
            { "name": "peak", "channel": "pmt", "aggregates": true, "mutates_plot": true,
              "fit": { "function": "gaussian", "main_fit": "x0",
                       "holds": { "offset": { "value": 0.0 } },
                       "validators": [ { "name": "narrow", "check": "between", "field": "sigma", "max": 2.0, "strict": true } ] } }
        ],
        "recovery": { "channel": "pmt", "threshold": 0.5 },
        "simulation": { "signals": [
            { "channel": "pmt", "function": "gaussian", "params": [0.0, 10.0, 0.2, 0.3], "noise": 0.1 }
        ] }
    }"#;

    #[test]
    fn parses_and_builds_sweep() {
        let file = parse_scan_file(GAUSSIAN_SCAN).unwrap();
        assert_eq!(file.settings.nrepeats, 3);
        assert_eq!(file.settings.npasses, 1);
        let recovery = file.recovery.as_ref().unwrap();
        assert_eq!(recovery.check.rewind, 1);
        assert_eq!(recovery.max_attempts, 3);

        let spec = file.models[0].fit.as_ref().unwrap();
        assert_eq!(spec.function, FitFunction::Gaussian);
        assert!(spec.validators[0].strict);

        let scan = file.build().unwrap();
        assert_eq!(scan.space().npoints(), Some(5));
        assert_eq!(scan.channels(), ["pmt".to_string()]);
    }

    #[test]
    fn grid_and_logspace_axes() {
        let points: PointsDef = serde_json::from_str(
            r#"{ "grid": [ { "kind": "values", "values": [0.0, 1.0] },
                          { "kind": "logspace", "min": 1.0, "max": 100.0, "steps": 3 } ] }"#,
        )
        .unwrap();
        let space = points.to_space().unwrap();
        assert_eq!(space.dims(), Some(vec![2, 3]));
        let inner = space.axis_values(1).unwrap();
        assert!((inner[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_recovery_channel_fails_setup() {
        let mut file = parse_scan_file(GAUSSIAN_SCAN).unwrap();
        if let Some(r) = file.recovery.as_mut() {
            r.check.channel = "apd".into();
        }
        assert!(matches!(file.build(), Err(ScanError::UnknownChannel(_))));
    }

    #[test]
    fn overrides_must_name_fitting_models() {
        let mut file = parse_scan_file(GAUSSIAN_SCAN).unwrap();
        file.overrides.insert("missing".into(), FitOverrides::default());
        assert!(matches!(file.build(), Err(ScanError::UnknownModel(_))));
    }

    #[test]
    fn malformed_json_is_json_error() {
        let err = parse_scan_file("{ \"points\": ").unwrap_err();
        assert!(matches!(err, ScanError::Json(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");
        std::fs::write(&path, GAUSSIAN_SCAN).unwrap();
        let file = read_scan_file(&path).unwrap();
        assert_eq!(file.models.len(), 1);
    }
}
