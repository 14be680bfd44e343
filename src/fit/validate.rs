//! Fit validators.
//!
//! Validators run in order; the first failure stops the chain. A failing
//! strict validator additionally flags the result as a bad fit.

use serde::{Deserialize, Serialize};

use crate::domain::FitResult;

/// A predicate over a fit's params, errors and analysis fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Param or analysis field within `[min, max]` (either side optional).
    Between {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Absolute parameter error at most `max`.
    ErrorBelow { param: String, max: f64 },
    /// `error / |value|` at most `max`.
    RelativeErrorBelow { param: String, max: f64 },
    /// Reduced chi-squared at most `max`.
    ResidualBelow { max: f64 },
    /// Parameter inside the scanned x range.
    WithinScan { param: String },
    /// Every param and error is finite.
    Finite,
}

impl Check {
    /// `Err` carries a human-readable failure message.
    pub fn evaluate(&self, fit: &FitResult) -> Result<(), String> {
        match self {
            Check::Between { field, min, max } => {
                let v = lookup(fit, field)?;
                if let Some(lo) = min {
                    if !(v >= *lo) {
                        return Err(format!("{field} = {v} is below {lo}"));
                    }
                }
                if let Some(hi) = max {
                    if !(v <= *hi) {
                        return Err(format!("{field} = {v} is above {hi}"));
                    }
                }
                Ok(())
            }
            Check::ErrorBelow { param, max } => {
                let err = fit
                    .error(param)
                    .ok_or_else(|| format!("no error for '{param}'"))?;
                if err <= *max {
                    Ok(())
                } else {
                    Err(format!("error of {param} = {err} exceeds {max}"))
                }
            }
            Check::RelativeErrorBelow { param, max } => {
                let v = lookup(fit, param)?;
                let err = fit
                    .error(param)
                    .ok_or_else(|| format!("no error for '{param}'"))?;
                let rel = if v == 0.0 { f64::INFINITY } else { err / v.abs() };
                if rel <= *max {
                    Ok(())
                } else {
                    Err(format!("relative error of {param} = {rel} exceeds {max}"))
                }
            }
            Check::ResidualBelow { max } => {
                if fit.residual <= *max {
                    Ok(())
                } else {
                    Err(format!("residual {} exceeds {max}", fit.residual))
                }
            }
            Check::WithinScan { param } => {
                let v = lookup(fit, param)?;
                let lo = lookup(fit, "scan_min")?;
                let hi = lookup(fit, "scan_max")?;
                if v >= lo && v <= hi {
                    Ok(())
                } else {
                    Err(format!("{param} = {v} is outside the scan range [{lo}, {hi}]"))
                }
            }
            Check::Finite => {
                let bad = fit
                    .params
                    .iter()
                    .chain(fit.errors.iter())
                    .find(|(_, v)| !v.is_finite());
                match bad {
                    Some((name, v)) => Err(format!("{name} is not finite ({v})")),
                    None => Ok(()),
                }
            }
        }
    }
}

fn lookup(fit: &FitResult, field: &str) -> Result<f64, String> {
    fit.field(field)
        .ok_or_else(|| format!("fit has no field '{field}'"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValidator {
    pub name: String,
    #[serde(flatten)]
    pub check: Check,
    #[serde(default)]
    pub strict: bool,
}

impl NamedValidator {
    pub fn new(name: impl Into<String>, check: Check) -> Self {
        Self {
            name: name.into(),
            check,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Run `validators` in order against `fit`.
///
/// A result that was already rejected (the backend could not fit) is
/// returned unchanged.
pub fn apply_validators(mut fit: FitResult, validators: &[NamedValidator]) -> FitResult {
    if !fit.accepted {
        return fit;
    }
    for v in validators {
        fit.attempted_validators.push(v.name.clone());
        if let Err(message) = v.check.evaluate(&fit) {
            fit.accepted = false;
            fit.bad_fit = v.strict;
            fit.validation_failures.push(format!("{}: {message}", v.name));
            break;
        }
    }
    fit
}
