//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - passed between the traversal, aggregation and fitting stages
//! - exported to JSON/CSV
//! - reloaded later for plotting

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ScanError;

/// One input value at which measurements are taken.
///
/// Flat and continuous spaces emit scalars; grids emit one coordinate per axis
/// (axis 0 outermost).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Point {
    Scalar(f64),
    Tuple(Vec<f64>),
}

impl Point {
    /// Number of coordinates.
    pub fn ndim(&self) -> usize {
        match self {
            Point::Scalar(_) => 1,
            Point::Tuple(coords) => coords.len(),
        }
    }

    /// Coordinate along `axis`, if the point has that many axes.
    pub fn coord(&self, axis: usize) -> Option<f64> {
        match self {
            Point::Scalar(x) if axis == 0 => Some(*x),
            Point::Scalar(_) => None,
            Point::Tuple(coords) => coords.get(axis).copied(),
        }
    }

    /// Coordinate of the innermost (fastest-varying) axis.
    pub fn innermost(&self) -> f64 {
        match self {
            Point::Scalar(x) => *x,
            Point::Tuple(coords) => coords.last().copied().unwrap_or(f64::NAN),
        }
    }

    /// Copy of this point with the innermost coordinate shifted by `offset`.
    pub fn shifted(&self, offset: f64) -> Point {
        match self {
            Point::Scalar(x) => Point::Scalar(x + offset),
            Point::Tuple(coords) => {
                let mut coords = coords.clone();
                if let Some(last) = coords.last_mut() {
                    *last += offset;
                }
                Point::Tuple(coords)
            }
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Scalar(x) => write!(f, "{x}"),
            Point::Tuple(coords) => {
                let parts: Vec<String> = coords.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Position of a traversal.
///
/// `npoints`/`npasses` are `None` for continuous scans, which never finish on
/// their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    /// Global repeat counter (number of repeats completed so far).
    pub i: u64,
    pub i_pass: usize,
    pub i_point: usize,
    pub i_repeat: usize,
    pub npoints: Option<usize>,
    pub npasses: Option<usize>,
    pub nrepeats: usize,
    pub nwarmup: usize,
    pub i_warmup: usize,
    pub warming_up: bool,
}

impl IterationState {
    pub fn new(npoints: Option<usize>, npasses: Option<usize>, nrepeats: usize, nwarmup: usize) -> Self {
        Self {
            i: 0,
            i_pass: 0,
            i_point: 0,
            i_repeat: 0,
            npoints,
            npasses,
            nrepeats,
            nwarmup,
            i_warmup: 0,
            warming_up: nwarmup > 0,
        }
    }

    /// True once every pass of a finite scan has completed.
    pub fn is_finished(&self) -> bool {
        matches!(self.npasses, Some(n) if self.i_pass >= n)
    }
}

/// When the recovery hook is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckGranularity {
    /// After every completed point.
    #[default]
    PerPoint,
    /// After every repeat.
    PerRepeat,
}

/// Pass/repeat/warmup configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_one")]
    pub npasses: usize,
    #[serde(default = "default_one")]
    pub nrepeats: usize,
    #[serde(default)]
    pub nwarmup: usize,
    #[serde(default)]
    pub check_granularity: CheckGranularity,
    /// Run the fitting stage at every pass boundary as well as at the end.
    #[serde(default)]
    pub fit_each_pass: bool,
}

fn default_one() -> usize {
    1
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            npasses: 1,
            nrepeats: 1,
            nwarmup: 0,
            check_granularity: CheckGranularity::PerPoint,
            fit_each_pass: false,
        }
    }
}

impl ScanSettings {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.npasses == 0 {
            return Err(ScanError::config("npasses must be >= 1"));
        }
        if self.nrepeats == 0 {
            return Err(ScanError::config("nrepeats must be >= 1"));
        }
        Ok(())
    }
}

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Init,
    Warmup,
    Measuring,
    Paused,
    Finalizing,
    Fitting,
    Done,
    Terminated,
}

/// What a call to `Scan::run` ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Paused,
    Terminated,
}

/// Outcome of fitting one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub model: String,
    pub function: String,
    #[serde(serialize_with = "finite_entries")]
    pub params: BTreeMap<String, f64>,
    #[serde(serialize_with = "finite_entries")]
    pub errors: BTreeMap<String, f64>,
    /// Derived quantities (e.g. `fwhm`, `scan_min`) available to validators.
    #[serde(serialize_with = "finite_entries")]
    pub analysis: BTreeMap<String, f64>,
    /// Reduced chi-squared of the fit; NaN when no fit was produced.
    #[serde(serialize_with = "finite_or_null", deserialize_with = "null_as_nan")]
    pub residual: f64,
    pub npoints: usize,
    pub accepted: bool,
    /// Set when a strict validator rejected the fit.
    pub bad_fit: bool,
    pub attempted_validators: Vec<String>,
    pub validation_failures: Vec<String>,
}

impl FitResult {
    /// A fit that could not be produced at all.
    pub fn rejected(model: &str, function: &str, reason: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            function: function.to_string(),
            params: BTreeMap::new(),
            errors: BTreeMap::new(),
            analysis: BTreeMap::new(),
            residual: f64::NAN,
            npoints: 0,
            accepted: false,
            bad_fit: false,
            attempted_validators: Vec::new(),
            validation_failures: vec![reason.into()],
        }
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn error(&self, name: &str) -> Option<f64> {
        self.errors.get(name).copied()
    }

    /// A parameter or, failing that, an analysis field.
    pub fn field(&self, name: &str) -> Option<f64> {
        self.param(name).or_else(|| self.analysis.get(name).copied())
    }

    /// The `BadFit` error for a strict rejection, if any.
    pub fn bad_fit_error(&self) -> Option<ScanError> {
        if !self.bad_fit {
            return None;
        }
        Some(ScanError::BadFit {
            model: self.model.clone(),
            validator: self.attempted_validators.last().cloned().unwrap_or_default(),
            message: self.validation_failures.first().cloned().unwrap_or_default(),
        })
    }
}

// JSON has no NaN/inf: non-finite map entries are dropped and a non-finite
// residual is written as null.
fn finite_entries<S: Serializer>(map: &BTreeMap<String, f64>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(map.iter().filter(|(_, v)| v.is_finite()))
}

fn finite_or_null<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    v.is_finite().then_some(*v).serialize(s)
}

fn null_as_nan<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
}

/// A fit of one series together with the outer indices that select it.
///
/// The prefix is empty for a 1-D scan; for an inner-axis fit in a grid it
/// holds the outer-axis indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixFit {
    pub prefix: Vec<usize>,
    pub fit: FitResult,
}

/// Per-channel results returned by `Scan::get_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResults {
    pub channel: String,
    /// Abscissa used for each cell (recorded point for measured channels,
    /// outer-axis value for calculated ones).
    pub xs: Vec<Option<f64>>,
    pub means: Vec<Option<f64>>,
    pub sems: Vec<Option<f64>>,
    pub counts: Vec<u64>,
    /// Top-level fit (empty prefix), if the channel has one.
    pub fit: Option<FitResult>,
    /// Every fit bound to the channel, including per-prefix inner fits.
    pub fits: Vec<PrefixFit>,
}
