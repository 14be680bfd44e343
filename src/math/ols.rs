//! Weighted least squares solver.
//!
//! The fit backend repeatedly solves small linear regression problems of the form:
//!
//! ```text
//! minimize Σ w_i (y_i - x_i^T β)^2
//! ```
//!
//! Every built-in fit function is linear in its amplitude/offset parameters once
//! the shape parameters are fixed, so β is solved once per shape candidate.
//!
//! Implementation choices:
//! - Rows are scaled by `sqrt(w_i)` and an ordinary least squares problem is solved.
//! - SVD handles tall (more rows than columns) and near-singular systems;
//!   nalgebra's `QR::solve` is intended for square systems.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-12, 1e-10, 1e-8] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Solve `minimize Σ w_i (y_i - x_i^T β)^2` for row-major design rows.
///
/// `rows` holds `y.len()` rows of `ncols` entries each.
pub fn solve_weighted(rows: &[f64], ncols: usize, y: &[f64], w: &[f64]) -> Option<Vec<f64>> {
    let n = y.len();
    if ncols == 0 || rows.len() != n * ncols || w.len() != n {
        return None;
    }

    let mut xw = DMatrix::<f64>::zeros(n, ncols);
    let mut yw = DVector::<f64>::zeros(n);
    for i in 0..n {
        let sw = w[i].sqrt();
        for j in 0..ncols {
            xw[(i, j)] = rows[i * ncols + j] * sw;
        }
        yw[i] = y[i] * sw;
    }

    solve_least_squares(&xw, &yw).map(|beta| beta.iter().copied().collect())
}

/// Moore–Penrose pseudo-inverse of a small square matrix.
pub fn pseudo_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inv = m.clone().pseudo_inverse(1e-12).ok()?;
    if inv.iter().all(|v| v.is_finite()) {
        Some(inv)
    } else {
        None
    }
}
