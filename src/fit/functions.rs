//! Built-in fit functions.
//!
//! Every function is written as
//!
//! ```text
//! y(x) = Σ_k  a_k · g_k(x; θ)
//! ```
//!
//! where the `a_k` are *linear* parameters (offsets and amplitudes) and `θ` are
//! *shape* parameters (centers, widths, time constants). Linear parameters are
//! always listed first. The backend grid-searches `θ` and solves the `a_k` by
//! weighted least squares, then refines everything jointly.

use std::collections::BTreeMap;
use std::f64::consts::{LN_2, PI};

use serde::{Deserialize, Serialize};

use crate::domain::FitResult;

/// `2 * sqrt(2 * ln 2)`: Gaussian FWHM in units of sigma.
const GAUSS_FWHM: f64 = 2.354_820_045_030_949;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFunction {
    /// `intercept + slope·x`
    Line,
    /// `c0 + c1·x + c2·x²`
    Quadratic,
    /// `offset + amplitude·exp(-(x-x0)²/(2σ²))`
    Gaussian,
    /// `offset + amplitude·γ²/((x-x0)² + γ²)`
    Lorentzian,
    /// `offset + amplitude·exp(-x/τ)`
    Exponential,
    /// `offset + amplitude·sin(2π·frequency·x + phase)`
    Sine,
}

impl FitFunction {
    pub fn name(self) -> &'static str {
        match self {
            FitFunction::Line => "line",
            FitFunction::Quadratic => "quadratic",
            FitFunction::Gaussian => "gaussian",
            FitFunction::Lorentzian => "lorentzian",
            FitFunction::Exponential => "exponential",
            FitFunction::Sine => "sine",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            FitFunction::Line,
            FitFunction::Quadratic,
            FitFunction::Gaussian,
            FitFunction::Lorentzian,
            FitFunction::Exponential,
            FitFunction::Sine,
        ]
        .into_iter()
        .find(|f| f.name() == name)
    }

    /// Parameter names, linear parameters first.
    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            FitFunction::Line => &["intercept", "slope"],
            FitFunction::Quadratic => &["c0", "c1", "c2"],
            FitFunction::Gaussian => &["offset", "amplitude", "x0", "sigma"],
            FitFunction::Lorentzian => &["offset", "amplitude", "x0", "gamma"],
            FitFunction::Exponential => &["offset", "amplitude", "tau"],
            FitFunction::Sine => &["offset", "amplitude", "frequency", "phase"],
        }
    }

    pub fn param_count(self) -> usize {
        self.param_names().len()
    }

    /// Number of linear parameters (they occupy the leading indices).
    pub fn linear_len(self) -> usize {
        match self {
            FitFunction::Line => 2,
            FitFunction::Quadratic => 3,
            _ => 2,
        }
    }

    pub fn param_index(self, name: &str) -> Option<usize> {
        self.param_names().iter().position(|p| *p == name)
    }

    /// Analysis fields this function derives (besides `scan_min`/`scan_max`).
    pub fn analysis_names(self) -> &'static [&'static str] {
        match self {
            FitFunction::Line => &["x_intercept"],
            FitFunction::Quadratic => &["vertex_x", "vertex_y"],
            FitFunction::Gaussian => &["fwhm", "area"],
            FitFunction::Lorentzian => &["fwhm"],
            FitFunction::Exponential => &["half_life"],
            FitFunction::Sine => &["period"],
        }
    }

    /// Fill the linear basis `g_k(x; θ)` for shape parameters `shape`.
    ///
    /// `out` must have length `linear_len()` and `shape` length
    /// `param_count() - linear_len()`.
    pub fn fill_basis(self, x: f64, shape: &[f64], out: &mut [f64]) {
        match self {
            FitFunction::Line => {
                out[0] = 1.0;
                out[1] = x;
            }
            FitFunction::Quadratic => {
                out[0] = 1.0;
                out[1] = x;
                out[2] = x * x;
            }
            FitFunction::Gaussian => {
                let (x0, sigma) = (shape[0], shape[1]);
                let z = (x - x0) / sigma;
                out[0] = 1.0;
                out[1] = (-0.5 * z * z).exp();
            }
            FitFunction::Lorentzian => {
                let (x0, gamma) = (shape[0], shape[1]);
                let g2 = gamma * gamma;
                let dx = x - x0;
                out[0] = 1.0;
                out[1] = g2 / (dx * dx + g2);
            }
            FitFunction::Exponential => {
                out[0] = 1.0;
                out[1] = (-x / shape[0]).exp();
            }
            FitFunction::Sine => {
                let (freq, phase) = (shape[0], shape[1]);
                out[0] = 1.0;
                out[1] = (2.0 * PI * freq * x + phase).sin();
            }
        }
    }

    /// Evaluate `y(x)` for a full parameter vector.
    pub fn eval(self, x: f64, params: &[f64]) -> f64 {
        let nl = self.linear_len();
        let mut basis = [0.0; 3];
        self.fill_basis(x, &params[nl..], &mut basis[..nl]);
        params[..nl].iter().zip(basis.iter()).map(|(a, g)| a * g).sum()
    }

    /// Evaluate a finished fit at `x`. `None` if the fit lacks a parameter
    /// or names an unknown function.
    pub fn eval_fit(fit: &FitResult, x: f64) -> Option<f64> {
        let function = FitFunction::from_name(&fit.function)?;
        let params = function
            .param_names()
            .iter()
            .map(|name| fit.param(name))
            .collect::<Option<Vec<f64>>>()?;
        Some(function.eval(x, &params))
    }

    /// Default parameter bounds.
    pub fn default_bounds(self) -> Vec<(f64, f64)> {
        let free = (f64::NEG_INFINITY, f64::INFINITY);
        let positive = (f64::MIN_POSITIVE, f64::INFINITY);
        match self {
            FitFunction::Line => vec![free, free],
            FitFunction::Quadratic => vec![free, free, free],
            FitFunction::Gaussian | FitFunction::Lorentzian => vec![free, free, free, positive],
            FitFunction::Exponential => vec![free, free, positive],
            FitFunction::Sine => vec![free, free, positive, (-2.0 * PI, 2.0 * PI)],
        }
    }

    /// Automatic starting values estimated from the data.
    pub fn auto_guess(self, xs: &[f64], ys: &[f64]) -> Vec<f64> {
        let shape = DataShape::of(xs, ys);
        match self {
            FitFunction::Line => {
                let slope = shape.end_slope;
                vec![shape.y_first - slope * shape.x_first, slope]
            }
            FitFunction::Quadratic => vec![shape.y_mean, 0.0, 0.0],
            FitFunction::Gaussian => {
                let width = shape.peak_width();
                vec![shape.y_median, shape.peak_height, shape.peak_x, width / GAUSS_FWHM]
            }
            FitFunction::Lorentzian => {
                let width = shape.peak_width();
                vec![shape.y_median, shape.peak_height, shape.peak_x, width / 2.0]
            }
            FitFunction::Exponential => vec![
                shape.y_last,
                shape.y_first - shape.y_last,
                shape.x_span / 3.0,
            ],
            FitFunction::Sine => {
                let crossings = shape.mean_crossings.max(1) as f64;
                vec![
                    shape.y_mean,
                    (shape.y_max - shape.y_min) / 2.0,
                    crossings / (2.0 * shape.x_span),
                    0.0,
                ]
            }
        }
    }

    /// Characteristic scale of each parameter, used to size the search.
    pub fn auto_scale(self, xs: &[f64], ys: &[f64], guess: &[f64]) -> Vec<f64> {
        let shape = DataShape::of(xs, ys);
        let y_scale = (shape.y_max - shape.y_min).abs().max(1e-12);
        let mut scales = vec![y_scale; self.param_count()];
        match self {
            FitFunction::Line | FitFunction::Quadratic => {}
            FitFunction::Gaussian | FitFunction::Lorentzian => {
                scales[2] = shape.x_span / 4.0;
                scales[3] = guess[3].abs().max(shape.min_step);
            }
            FitFunction::Exponential => {
                scales[2] = guess[2].abs().max(shape.min_step);
            }
            FitFunction::Sine => {
                scales[2] = (guess[2].abs() / 2.0).max(1e-12);
                scales[3] = PI;
            }
        }
        scales
    }

    /// Derived quantities for validators and reports.
    pub fn analysis(self, params: &[f64]) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        match self {
            FitFunction::Line => {
                if params[1] != 0.0 {
                    out.insert("x_intercept".to_string(), -params[0] / params[1]);
                }
            }
            FitFunction::Quadratic => {
                if params[2] != 0.0 {
                    let vx = -params[1] / (2.0 * params[2]);
                    out.insert("vertex_x".to_string(), vx);
                    out.insert("vertex_y".to_string(), self.eval(vx, params));
                }
            }
            FitFunction::Gaussian => {
                let sigma = params[3].abs();
                out.insert("fwhm".to_string(), GAUSS_FWHM * sigma);
                out.insert("area".to_string(), params[1] * sigma * (2.0 * PI).sqrt());
            }
            FitFunction::Lorentzian => {
                out.insert("fwhm".to_string(), 2.0 * params[3].abs());
            }
            FitFunction::Exponential => {
                out.insert("half_life".to_string(), params[2] * LN_2);
            }
            FitFunction::Sine => {
                if params[2] != 0.0 {
                    out.insert("period".to_string(), 1.0 / params[2]);
                }
            }
        }
        out
    }
}

/// Cheap summary of a data series used by the automatic guesses.
#[derive(Debug, Clone)]
struct DataShape {
    x_first: f64,
    y_first: f64,
    y_last: f64,
    x_span: f64,
    min_step: f64,
    end_slope: f64,
    y_min: f64,
    y_max: f64,
    y_mean: f64,
    y_median: f64,
    peak_x: f64,
    peak_height: f64,
    /// Number of points further than half the peak height from the median.
    above_half: usize,
    n: usize,
    mean_crossings: usize,
}

impl DataShape {
    fn of(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len().min(ys.len());
        if n == 0 {
            return Self::empty();
        }
        let xs = &xs[..n];
        let ys = &ys[..n];

        let x_min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let x_max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let x_span = if x_max > x_min { x_max - x_min } else { 1.0 };
        let y_min = ys.iter().copied().fold(f64::INFINITY, f64::min);
        let y_max = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let y_mean = ys.iter().sum::<f64>() / n as f64;
        let y_median = median(ys);

        let mut peak_idx = 0;
        for i in 1..n {
            if (ys[i] - y_median).abs() > (ys[peak_idx] - y_median).abs() {
                peak_idx = i;
            }
        }
        let peak_height = ys[peak_idx] - y_median;
        let above_half = ys
            .iter()
            .filter(|y| (*y - y_median).abs() >= peak_height.abs() / 2.0)
            .count();

        let mut sorted_x = xs.to_vec();
        sorted_x.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let min_step = sorted_x
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d > 0.0)
            .fold(f64::INFINITY, f64::min);
        let min_step = if min_step.is_finite() { min_step } else { x_span };

        let dx = xs[n - 1] - xs[0];
        let end_slope = if dx != 0.0 { (ys[n - 1] - ys[0]) / dx } else { 0.0 };

        let mean_crossings = ys
            .windows(2)
            .filter(|w| (w[0] - y_mean).signum() != (w[1] - y_mean).signum())
            .count();

        Self {
            x_first: xs[0],
            y_first: ys[0],
            y_last: ys[n - 1],
            x_span,
            min_step,
            end_slope,
            y_min,
            y_max,
            y_mean,
            y_median,
            peak_x: xs[peak_idx],
            peak_height,
            above_half,
            n,
            mean_crossings,
        }
    }

    fn empty() -> Self {
        Self {
            x_first: 0.0,
            y_first: 0.0,
            y_last: 0.0,
            x_span: 1.0,
            min_step: 1.0,
            end_slope: 0.0,
            y_min: 0.0,
            y_max: 0.0,
            y_mean: 0.0,
            y_median: 0.0,
            peak_x: 0.0,
            peak_height: 0.0,
            above_half: 0,
            n: 0,
            mean_crossings: 0,
        }
    }

    /// Rough full width of the peak from the points above half height.
    fn peak_width(&self) -> f64 {
        let spacing = if self.n > 1 {
            self.x_span / (self.n as f64 - 1.0)
        } else {
            self.x_span
        };
        (self.above_half as f64 * spacing).max(self.min_step)
    }
}

fn median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 1 {
        v[mid]
    } else {
        (v[mid - 1] + v[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_matches_closed_forms() {
        let g = FitFunction::Gaussian.eval(1.0, &[0.5, 2.0, 1.0, 0.3]);
        assert!((g - 2.5).abs() < 1e-12);

        let l = FitFunction::Lorentzian.eval(2.0, &[0.0, 4.0, 1.0, 1.0]);
        assert!((l - 2.0).abs() < 1e-12);

        let e = FitFunction::Exponential.eval(0.0, &[1.0, 3.0, 2.0]);
        assert!((e - 4.0).abs() < 1e-12);

        let q = FitFunction::Quadratic.eval(2.0, &[1.0, 2.0, 3.0]);
        assert!((q - 17.0).abs() < 1e-12);
    }

    #[test]
    fn linear_params_lead_every_function() {
        for f in [
            FitFunction::Line,
            FitFunction::Quadratic,
            FitFunction::Gaussian,
            FitFunction::Lorentzian,
            FitFunction::Exponential,
            FitFunction::Sine,
        ] {
            assert!(f.linear_len() <= f.param_count());
            assert_eq!(f.default_bounds().len(), f.param_count());
        }
    }

    #[test]
    fn gaussian_guess_finds_peak() {
        let xs: Vec<f64> = (0..21).map(|i| -2.0 + 0.2 * i as f64).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| FitFunction::Gaussian.eval(x, &[1.0, 10.0, 0.4, 0.5]))
            .collect();
        let guess = FitFunction::Gaussian.auto_guess(&xs, &ys);
        assert!((guess[2] - 0.4).abs() < 1e-9);
        assert!(guess[1] > 5.0);
        assert!(guess[3] > 0.0);
    }

    #[test]
    fn analysis_reports_widths() {
        let a = FitFunction::Gaussian.analysis(&[0.0, 1.0, 0.0, 1.0]);
        assert!((a["fwhm"] - GAUSS_FWHM).abs() < 1e-12);
        let e = FitFunction::Exponential.analysis(&[0.0, 1.0, 2.0]);
        assert!((e["half_life"] - 2.0 * LN_2).abs() < 1e-12);
    }

    #[test]
    fn function_names_round_trip_through_serde() {
        let f: FitFunction = serde_json::from_str("\"lorentzian\"").unwrap();
        assert_eq!(f, FitFunction::Lorentzian);
        assert_eq!(f.param_index("gamma"), Some(3));
        assert_eq!(FitFunction::from_name("sine"), Some(FitFunction::Sine));
        assert_eq!(FitFunction::from_name("spline"), None);
    }

    #[test]
    fn eval_fit_needs_every_parameter() {
        let mut fit = FitResult::rejected("m", "line", "");
        fit.params.insert("intercept".into(), 1.0);
        assert_eq!(FitFunction::eval_fit(&fit, 2.0), None);
        fit.params.insert("slope".into(), 3.0);
        assert_eq!(FitFunction::eval_fit(&fit, 2.0), Some(7.0));
    }
}
