//! Fit configuration resolution and the fit → validate pipeline.
//!
//! Starting values are resolved per parameter, most specific first:
//!
//! 1. a per-call guess marked `always`
//! 2. a model guess marked `always`
//! 3. a per-call guess
//! 4. a model guess
//! 5. the function's automatic guess from the data
//!
//! Scales, bounds and holds follow per-call > model > function default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::FitResult;
use crate::error::{ScanError, ScanResult};
use crate::fit::{FitBackend, FitFunction, FitRequest, GridLeastSquares, NamedValidator, apply_validators};

/// Starting value for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Guess {
    pub value: f64,
    /// Wins over less specific guesses even when they are explicit.
    #[serde(default)]
    pub always: bool,
}

impl From<f64> for Guess {
    fn from(value: f64) -> Self {
        Self {
            value,
            always: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// A parameter excluded from the search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hold {
    Value(f64),
    /// Fixed at whatever the resolved guess is.
    AtGuess,
}

/// Designates the scan's primary output.
///
/// `Param("x0")` saves under `"{channel}.x0"`; `Dataset` names the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MainFit {
    Param(String),
    Dataset { param: String, dataset: String },
}

impl MainFit {
    pub fn param(&self) -> &str {
        match self {
            MainFit::Param(p) => p,
            MainFit::Dataset { param, .. } => param,
        }
    }

    pub fn dataset_name(&self, channel: &str) -> String {
        match self {
            MainFit::Param(p) => format!("{channel}.{p}"),
            MainFit::Dataset { dataset, .. } => dataset.clone(),
        }
    }
}

/// Where `extract_main_fit` reads the value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MainFitSource {
    #[default]
    Fit,
    Dataset,
}

/// Model-declared fit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    pub function: FitFunction,
    #[serde(default)]
    pub guesses: BTreeMap<String, Guess>,
    #[serde(default)]
    pub scales: BTreeMap<String, f64>,
    #[serde(default)]
    pub bounds: BTreeMap<String, Bounds>,
    #[serde(default)]
    pub holds: BTreeMap<String, Hold>,
    #[serde(default)]
    pub validators: Vec<NamedValidator>,
    #[serde(default)]
    pub main_fit: Option<MainFit>,
}

impl FitSpec {
    pub fn new(function: FitFunction) -> Self {
        Self {
            function,
            guesses: BTreeMap::new(),
            scales: BTreeMap::new(),
            bounds: BTreeMap::new(),
            holds: BTreeMap::new(),
            validators: Vec::new(),
            main_fit: None,
        }
    }

    pub fn with_guess(mut self, param: &str, guess: impl Into<Guess>) -> Self {
        self.guesses.insert(param.to_string(), guess.into());
        self
    }

    pub fn with_scale(mut self, param: &str, scale: f64) -> Self {
        self.scales.insert(param.to_string(), scale);
        self
    }

    pub fn with_bounds(mut self, param: &str, min: Option<f64>, max: Option<f64>) -> Self {
        self.bounds.insert(param.to_string(), Bounds { min, max });
        self
    }

    pub fn with_hold(mut self, param: &str, hold: Hold) -> Self {
        self.holds.insert(param.to_string(), hold);
        self
    }

    pub fn with_validator(mut self, validator: NamedValidator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_main_fit(mut self, main_fit: MainFit) -> Self {
        self.main_fit = Some(main_fit);
        self
    }

    /// Reject parameter names the function does not have.
    pub fn check_names(&self) -> ScanResult<()> {
        check_param_names(
            self.function,
            self.guesses
                .keys()
                .chain(self.scales.keys())
                .chain(self.bounds.keys())
                .chain(self.holds.keys()),
        )?;
        if let Some(main) = &self.main_fit {
            if !is_field(self.function, main.param()) {
                return Err(ScanError::config(format!(
                    "main fit '{}' is not a field of {}",
                    main.param(),
                    self.function.name()
                )));
            }
        }
        Ok(())
    }
}

/// Per-call overrides layered over a [`FitSpec`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitOverrides {
    #[serde(default)]
    pub guesses: BTreeMap<String, Guess>,
    #[serde(default)]
    pub scales: BTreeMap<String, f64>,
    #[serde(default)]
    pub bounds: BTreeMap<String, Bounds>,
    #[serde(default)]
    pub holds: BTreeMap<String, Hold>,
}

impl FitOverrides {
    pub fn is_empty(&self) -> bool {
        self.guesses.is_empty() && self.scales.is_empty() && self.bounds.is_empty() && self.holds.is_empty()
    }
}

fn check_param_names<'a>(function: FitFunction, names: impl Iterator<Item = &'a String>) -> ScanResult<()> {
    for name in names {
        if function.param_index(name).is_none() {
            return Err(ScanError::config(format!(
                "{} has no parameter '{name}' (expected one of {:?})",
                function.name(),
                function.param_names()
            )));
        }
    }
    Ok(())
}

fn is_field(function: FitFunction, name: &str) -> bool {
    function.param_index(name).is_some()
        || function.analysis_names().contains(&name)
        || name == "scan_min"
        || name == "scan_max"
}

/// Runs a backend over one series and validates the outcome.
#[derive(Debug)]
pub struct FitPipeline {
    backend: Box<dyn FitBackend>,
}

impl Default for FitPipeline {
    fn default() -> Self {
        Self::new(Box::new(GridLeastSquares::default()))
    }
}

impl FitPipeline {
    pub fn new(backend: Box<dyn FitBackend>) -> Self {
        Self { backend }
    }

    /// Fit one `(x, mean, sem)` series.
    ///
    /// Points with a missing x or mean are skipped. A backend failure is
    /// recorded as a rejected result, not returned as an error; only bad
    /// configuration (unknown parameter names) is an `Err`.
    pub fn fit(
        &self,
        model: &str,
        xs: &[f64],
        means: &[f64],
        sems: &[f64],
        spec: &FitSpec,
        overrides: &FitOverrides,
    ) -> ScanResult<FitResult> {
        let f = spec.function;
        check_param_names(
            f,
            overrides
                .guesses
                .keys()
                .chain(overrides.scales.keys())
                .chain(overrides.bounds.keys())
                .chain(overrides.holds.keys()),
        )?;

        let mut x = Vec::with_capacity(xs.len());
        let mut y = Vec::with_capacity(xs.len());
        let mut e = Vec::with_capacity(xs.len());
        for ((&xi, &yi), &ei) in xs.iter().zip(means).zip(sems) {
            if xi.is_finite() && yi.is_finite() {
                x.push(xi);
                y.push(yi);
                e.push(if ei.is_finite() { ei } else { 0.0 });
            }
        }
        if x.is_empty() {
            return Ok(FitResult::rejected(model, f.name(), "no data to fit"));
        }

        let names = f.param_names();
        let auto = f.auto_guess(&x, &y);
        let guesses: Vec<f64> = names
            .iter()
            .zip(&auto)
            .map(|(name, &auto)| resolve_guess(name, &spec.guesses, &overrides.guesses).unwrap_or(auto))
            .collect();

        let auto_scales = f.auto_scale(&x, &y, &guesses);
        let scales: Vec<f64> = names
            .iter()
            .zip(auto_scales)
            .map(|(name, auto)| {
                overrides
                    .scales
                    .get(*name)
                    .or_else(|| spec.scales.get(*name))
                    .copied()
                    .unwrap_or(auto)
            })
            .collect();

        let bounds: Vec<(f64, f64)> = names
            .iter()
            .zip(f.default_bounds())
            .map(|(name, (lo, hi))| {
                let model = spec.bounds.get(*name).copied().unwrap_or_default();
                let call = overrides.bounds.get(*name).copied().unwrap_or_default();
                (
                    call.min.or(model.min).unwrap_or(lo),
                    call.max.or(model.max).unwrap_or(hi),
                )
            })
            .collect();

        let holds: Vec<Option<f64>> = names
            .iter()
            .zip(&guesses)
            .map(|(name, &guess)| {
                overrides
                    .holds
                    .get(*name)
                    .or_else(|| spec.holds.get(*name))
                    .map(|hold| match hold {
                        Hold::Value(v) => *v,
                        Hold::AtGuess => guess,
                    })
            })
            .collect();

        let request = FitRequest {
            function: f,
            xs: &x,
            ys: &y,
            yerrs: &e,
            guesses,
            scales,
            bounds,
            holds,
        };
        let fitted = match self.backend.fit(&request) {
            Ok(fitted) => fitted,
            Err(err) => {
                warn!(model, function = f.name(), error = %err, "fit failed");
                let mut rejected = FitResult::rejected(model, f.name(), err.to_string());
                rejected.npoints = x.len();
                return Ok(rejected);
            }
        };

        let mut analysis = f.analysis(&fitted.params);
        let scan_min = x.iter().copied().fold(f64::INFINITY, f64::min);
        let scan_max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        analysis.insert("scan_min".to_string(), scan_min);
        analysis.insert("scan_max".to_string(), scan_max);

        let to_map = |values: &[f64]| -> BTreeMap<String, f64> {
            names.iter().map(|n| n.to_string()).zip(values.iter().copied()).collect()
        };

        debug!(model, function = f.name(), residual = fitted.residual, "fit done");
        Ok(FitResult {
            model: model.to_string(),
            function: f.name().to_string(),
            params: to_map(&fitted.params),
            errors: to_map(&fitted.errors),
            analysis,
            residual: fitted.residual,
            npoints: x.len(),
            accepted: true,
            bad_fit: false,
            attempted_validators: Vec::new(),
            validation_failures: Vec::new(),
        })
    }

    pub fn validate(&self, fit: FitResult, validators: &[NamedValidator]) -> FitResult {
        let out = apply_validators(fit, validators);
        if !out.accepted {
            warn!(
                model = %out.model,
                strict = out.bad_fit,
                failures = ?out.validation_failures,
                "fit not accepted"
            );
        }
        out
    }

    /// `fit` followed by the `FitSpec` validators.
    pub fn fit_and_validate(
        &self,
        model: &str,
        xs: &[f64],
        means: &[f64],
        sems: &[f64],
        spec: &FitSpec,
        overrides: &FitOverrides,
    ) -> ScanResult<FitResult> {
        let fit = self.fit(model, xs, means, sems, spec, overrides)?;
        Ok(self.validate(fit, &spec.validators))
    }
}

fn resolve_guess(
    name: &str,
    model: &BTreeMap<String, Guess>,
    call: &BTreeMap<String, Guess>,
) -> Option<f64> {
    let call = call.get(name);
    let model = model.get(name);
    call.filter(|g| g.always)
        .or(model.filter(|g| g.always))
        .or(call)
        .or(model)
        .map(|g| g.value)
}

/// The main-fit value of `channel` and the dataset it is saved under.
///
/// With [`MainFitSource::Fit`] the value comes from an accepted fit; with
/// [`MainFitSource::Dataset`] it is read from previously saved datasets.
pub fn extract_main_fit(
    channel: &str,
    main_fit: &MainFit,
    fit: Option<&FitResult>,
    source: MainFitSource,
    datasets: &BTreeMap<String, f64>,
) -> Option<(String, f64)> {
    let name = main_fit.dataset_name(channel);
    let value = match source {
        MainFitSource::Fit => fit.filter(|f| f.accepted)?.field(main_fit.param())?,
        MainFitSource::Dataset => *datasets.get(&name)?,
    };
    Some((name, value))
}
