//! Numerical fit backend.
//!
//! The orchestrator only talks to [`FitBackend`]; the built-in implementation
//! is [`GridLeastSquares`]:
//!
//! 1. Build a grid over every free *shape* parameter around its guess.
//! 2. For each shape candidate (in parallel), solve the linear parameters by
//!    weighted OLS and score the candidate by weighted SSE.
//! 3. Pick the minimum SSE, breaking ties by grid index.
//! 4. Refine all free parameters jointly with damped Gauss-Newton steps.
//!
//! Parameter errors come from the pseudo-inverse of `JᵀWJ`, scaled by the
//! reduced chi-squared.

use std::fmt::Debug;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::fit::FitFunction;
use crate::math::{cartesian, lin_space, log_space, pseudo_inverse, solve_least_squares, solve_weighted};

/// Fully resolved inputs for one backend call.
///
/// All vectors indexed by parameter follow `function.param_names()`.
#[derive(Debug, Clone)]
pub struct FitRequest<'a> {
    pub function: FitFunction,
    pub xs: &'a [f64],
    pub ys: &'a [f64],
    pub yerrs: &'a [f64],
    pub guesses: Vec<f64>,
    pub scales: Vec<f64>,
    pub bounds: Vec<(f64, f64)>,
    /// `Some(v)` fixes the parameter at `v`.
    pub holds: Vec<Option<f64>>,
}

impl FitRequest<'_> {
    fn free_params(&self) -> Vec<usize> {
        (0..self.function.param_count())
            .filter(|&k| self.holds[k].is_none())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendFit {
    pub params: Vec<f64>,
    pub errors: Vec<f64>,
    /// Reduced chi-squared.
    pub residual: f64,
}

/// Pluggable function-fitting service.
pub trait FitBackend: Debug + Send + Sync {
    fn fit(&self, request: &FitRequest<'_>) -> ScanResult<BackendFit>;
}

/// Grid search over shape parameters + weighted OLS + local refinement.
#[derive(Debug, Clone)]
pub struct GridLeastSquares {
    /// Grid points per free shape parameter.
    pub grid_steps: usize,
    /// Half-width of each shape grid in units of the parameter scale.
    pub grid_span: f64,
    /// Maximum refinement iterations (0 disables refinement).
    pub refine_iters: usize,
}

impl Default for GridLeastSquares {
    fn default() -> Self {
        Self {
            grid_steps: 15,
            grid_span: 2.0,
            refine_iters: 50,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    idx: usize,
    params: Vec<f64>,
    sse: f64,
}

impl FitBackend for GridLeastSquares {
    fn fit(&self, req: &FitRequest<'_>) -> ScanResult<BackendFit> {
        let n = req.xs.len();
        let count = req.function.param_count();
        if req.ys.len() != n || req.yerrs.len() != n {
            return Err(ScanError::Fit(format!(
                "series length mismatch: {} xs, {} ys, {} errors",
                n,
                req.ys.len(),
                req.yerrs.len()
            )));
        }
        if req.guesses.len() != count
            || req.scales.len() != count
            || req.bounds.len() != count
            || req.holds.len() != count
        {
            return Err(ScanError::Fit(format!(
                "{} expects {count} parameters",
                req.function.name()
            )));
        }
        let free = req.free_params();
        if n == 0 || n < free.len() {
            return Err(ScanError::Fit(format!(
                "underdetermined: {n} points for {} free parameters of {}",
                free.len(),
                req.function.name()
            )));
        }
        if req.xs.iter().chain(req.ys).any(|v| !v.is_finite()) {
            return Err(ScanError::Fit("non-finite data in series".to_string()));
        }

        let w = weights_from(req.yerrs);
        let nl = req.function.linear_len();

        let axes: Vec<Vec<f64>> = (nl..count)
            .map(|k| match req.holds[k] {
                Some(v) => vec![v],
                None => shape_axis(
                    req.guesses[k],
                    req.scales[k],
                    req.bounds[k],
                    self.grid_steps,
                    self.grid_span,
                ),
            })
            .collect();
        let grid = cartesian(&axes);

        let candidates: Vec<Candidate> = grid
            .par_iter()
            .enumerate()
            .filter_map(|(idx, shape)| {
                solve_linear(req, shape, &w).map(|(params, sse)| Candidate { idx, params, sse })
            })
            .collect();

        let Some(first) = candidates.first() else {
            return Err(ScanError::Fit(format!(
                "no valid candidates for {}",
                req.function.name()
            )));
        };
        let mut best = first;
        for c in &candidates[1..] {
            if c.sse < best.sse || (c.sse == best.sse && c.idx < best.idx) {
                best = c;
            }
        }
        debug!(
            function = req.function.name(),
            candidates = candidates.len(),
            sse = best.sse,
            "grid search done"
        );

        let params = if self.refine_iters > 0 && !free.is_empty() {
            refine(req, &w, &free, best.params.clone(), self.refine_iters)
        } else {
            best.params.clone()
        };

        let chi2 = weighted_sse(req, &w, &params);
        let dof = n - free.len();
        let residual = if dof > 0 { chi2 / dof as f64 } else { chi2 };

        let mut errors = vec![0.0; count];
        if !free.is_empty() {
            let jac = jacobian(req, &params, &free);
            let info = weighted_normal_matrix(&jac, &w);
            let cov_scale = if dof > 0 { residual } else { 1.0 };
            match pseudo_inverse(&info) {
                Some(cov) => {
                    for (col, &k) in free.iter().enumerate() {
                        errors[k] = (cov[(col, col)].max(0.0) * cov_scale).sqrt();
                    }
                }
                None => {
                    for &k in &free {
                        errors[k] = f64::NAN;
                    }
                }
            }
        }

        Ok(BackendFit {
            params,
            errors,
            residual,
        })
    }
}

/// Inverse-variance weights.
///
/// Zero or invalid errors would give infinite weights; they are replaced by
/// the smallest valid error, or uniform weights if there is none.
fn weights_from(yerrs: &[f64]) -> Vec<f64> {
    let floor = yerrs
        .iter()
        .copied()
        .filter(|e| e.is_finite() && *e > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !floor.is_finite() {
        return vec![1.0; yerrs.len()];
    }
    yerrs
        .iter()
        .map(|&e| {
            let e = if e.is_finite() && e > 0.0 { e } else { floor };
            1.0 / (e * e)
        })
        .collect()
}

/// Candidate values for one shape parameter.
///
/// Positive-bounded parameters get a log grid (`guess / r .. guess * r`),
/// others a linear grid (`guess ± span * scale`). The guess itself is always
/// included; values are clamped to bounds and deduplicated.
fn shape_axis(guess: f64, scale: f64, bounds: (f64, f64), steps: usize, span: f64) -> Vec<f64> {
    let (lo, hi) = bounds;
    let scale = scale.abs();
    let steps = steps.max(1);
    let raw = if lo >= 0.0 && guess > 0.0 {
        let ratio = 1.0 + span * scale / guess;
        log_space(guess / ratio, guess * ratio, steps).unwrap_or_default()
    } else {
        lin_space(guess - span * scale, guess + span * scale, steps).unwrap_or_default()
    };
    let mut values: Vec<f64> = raw
        .into_iter()
        .chain(std::iter::once(guess))
        .filter(|v| v.is_finite())
        .map(|v| clamp(v, bounds))
        .collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    if values.is_empty() {
        values.push(clamp(0.0, (lo, hi)));
    }
    values
}

fn clamp(v: f64, (lo, hi): (f64, f64)) -> f64 {
    if lo <= hi { v.clamp(lo, hi) } else { v }
}

/// Solve the free linear parameters for fixed shape parameters.
fn solve_linear(req: &FitRequest<'_>, shape: &[f64], w: &[f64]) -> Option<(Vec<f64>, f64)> {
    let f = req.function;
    let nl = f.linear_len();
    let free_lin: Vec<usize> = (0..nl).filter(|&k| req.holds[k].is_none()).collect();

    let mut basis = vec![0.0; nl];
    let mut rows = Vec::with_capacity(req.xs.len() * free_lin.len());
    let mut y_adj = Vec::with_capacity(req.xs.len());
    for (&x, &y) in req.xs.iter().zip(req.ys) {
        f.fill_basis(x, shape, &mut basis);
        // Held linear contributions move to the left-hand side.
        let held: f64 = (0..nl)
            .filter_map(|k| req.holds[k].map(|v| v * basis[k]))
            .sum();
        y_adj.push(y - held);
        rows.extend(free_lin.iter().map(|&k| basis[k]));
    }

    let mut params = vec![0.0; f.param_count()];
    for k in 0..nl {
        if let Some(v) = req.holds[k] {
            params[k] = v;
        }
    }
    if !free_lin.is_empty() {
        let beta = solve_weighted(&rows, free_lin.len(), &y_adj, w)?;
        for (&k, b) in free_lin.iter().zip(beta) {
            params[k] = b;
        }
    }
    params[nl..].copy_from_slice(shape);

    let in_bounds = params
        .iter()
        .zip(&req.bounds)
        .all(|(&p, &(lo, hi))| p >= lo && p <= hi);
    if !in_bounds {
        return None;
    }

    let sse = weighted_sse(req, w, &params);
    sse.is_finite().then_some((params, sse))
}

fn weighted_sse(req: &FitRequest<'_>, w: &[f64], params: &[f64]) -> f64 {
    req.xs
        .iter()
        .zip(req.ys)
        .zip(w)
        .map(|((&x, &y), &wi)| {
            let r = y - req.function.eval(x, params);
            wi * r * r
        })
        .sum()
}

/// Central-difference Jacobian with respect to the free parameters.
fn jacobian(req: &FitRequest<'_>, params: &[f64], free: &[usize]) -> DMatrix<f64> {
    let n = req.xs.len();
    let mut jac = DMatrix::<f64>::zeros(n, free.len());
    let mut hi = params.to_vec();
    let mut lo = params.to_vec();
    for (col, &k) in free.iter().enumerate() {
        let h = 1e-6 * params[k].abs().max(req.scales[k].abs()).max(1e-9);
        hi[k] = params[k] + h;
        lo[k] = params[k] - h;
        for (i, &x) in req.xs.iter().enumerate() {
            jac[(i, col)] = (req.function.eval(x, &hi) - req.function.eval(x, &lo)) / (2.0 * h);
        }
        hi[k] = params[k];
        lo[k] = params[k];
    }
    jac
}

fn weighted_normal_matrix(jac: &DMatrix<f64>, w: &[f64]) -> DMatrix<f64> {
    let w = DVector::from_row_slice(w);
    let wj = DMatrix::from_fn(jac.nrows(), jac.ncols(), |i, j| jac[(i, j)] * w[i]);
    jac.transpose() * wj
}

/// Damped Gauss-Newton (Levenberg-Marquardt) refinement.
fn refine(req: &FitRequest<'_>, w: &[f64], free: &[usize], start: Vec<f64>, iters: usize) -> Vec<f64> {
    let mut params = start;
    let mut chi2 = weighted_sse(req, w, &params);
    let mut lambda = 1e-3;

    for _ in 0..iters {
        if chi2 <= 0.0 {
            break;
        }
        let jac = jacobian(req, &params, free);
        let resid = DVector::from_iterator(
            req.xs.len(),
            req.xs
                .iter()
                .zip(req.ys)
                .zip(w)
                .map(|((&x, &y), &wi)| wi * (y - req.function.eval(x, &params))),
        );
        let info = weighted_normal_matrix(&jac, w);
        let grad = jac.transpose() * resid;

        let mut step_taken = None;
        for _ in 0..12 {
            let mut damped = info.clone();
            for d in 0..free.len() {
                damped[(d, d)] += lambda * info[(d, d)].max(1e-12);
            }
            if let Some(delta) = solve_least_squares(&damped, &grad) {
                let mut trial = params.clone();
                for (col, &k) in free.iter().enumerate() {
                    trial[k] = clamp(params[k] + delta[col], req.bounds[k]);
                }
                let c = weighted_sse(req, w, &trial);
                if c.is_finite() && c < chi2 {
                    step_taken = Some((trial, c));
                    lambda = (lambda / 10.0).max(1e-12);
                    break;
                }
            }
            lambda *= 10.0;
        }

        let Some((trial, c)) = step_taken else { break };
        let gain = (chi2 - c) / chi2;
        params = trial;
        chi2 = c;
        if gain < 1e-12 {
            break;
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        function: FitFunction,
        xs: &'a [f64],
        ys: &'a [f64],
        yerrs: &'a [f64],
    ) -> FitRequest<'a> {
        let guesses = function.auto_guess(xs, ys);
        let scales = function.auto_scale(xs, ys, &guesses);
        FitRequest {
            function,
            xs,
            ys,
            yerrs,
            guesses,
            scales,
            bounds: function.default_bounds(),
            holds: vec![None; function.param_count()],
        }
    }

    #[test]
    fn line_fit_is_exact_on_clean_data() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 + 3.0 * x).collect();
        let errs = [0.1; 5];
        let fit = GridLeastSquares::default()
            .fit(&request(FitFunction::Line, &xs, &ys, &errs))
            .unwrap();
        assert!((fit.params[0] - 2.0).abs() < 1e-9);
        assert!((fit.params[1] - 3.0).abs() < 1e-9);
        assert!(fit.residual < 1e-12);
    }

    #[test]
    fn gaussian_fit_recovers_parameters() {
        let truth = [1.0, 5.0, 0.3, 0.8];
        let xs: Vec<f64> = (0..41).map(|i| -3.0 + 0.15 * i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| FitFunction::Gaussian.eval(x, &truth)).collect();
        let errs = vec![0.05; xs.len()];
        let fit = GridLeastSquares::default()
            .fit(&request(FitFunction::Gaussian, &xs, &ys, &errs))
            .unwrap();
        for (got, want) in fit.params.iter().zip(truth) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn held_parameters_stay_fixed() {
        let truth = [1.0, 5.0, 0.3, 0.8];
        let xs: Vec<f64> = (0..41).map(|i| -3.0 + 0.15 * i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| FitFunction::Gaussian.eval(x, &truth)).collect();
        let errs = vec![0.05; xs.len()];
        let mut req = request(FitFunction::Gaussian, &xs, &ys, &errs);
        req.holds[0] = Some(1.0);
        req.holds[2] = Some(0.3);
        let fit = GridLeastSquares::default().fit(&req).unwrap();
        assert_eq!(fit.params[0], 1.0);
        assert_eq!(fit.params[2], 0.3);
        assert_eq!(fit.errors[0], 0.0);
        assert!((fit.params[3] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let xs = [0.0, 1.0];
        let ys = [1.0, 2.0];
        let errs = [0.1, 0.1];
        let err = GridLeastSquares::default()
            .fit(&request(FitFunction::Gaussian, &xs, &ys, &errs))
            .unwrap_err();
        assert!(matches!(err, ScanError::Fit(_)));
    }

    #[test]
    fn zero_errors_fall_back_to_smallest_positive() {
        assert_eq!(weights_from(&[0.0, 0.5]), vec![4.0, 4.0]);
        assert_eq!(weights_from(&[0.0, 0.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn shape_axis_respects_bounds_and_keeps_guess() {
        let axis = shape_axis(0.5, 0.5, (f64::MIN_POSITIVE, 1.0), 9, 2.0);
        assert!(axis.contains(&0.5));
        assert!(axis.iter().all(|v| *v > 0.0 && *v <= 1.0));
        assert!(axis.windows(2).all(|w| w[0] < w[1]));
    }
}
