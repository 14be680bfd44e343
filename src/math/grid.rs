//! Point grids.
//!
//! Used both to build scan axes (`lin_space`, `log_space`) and to enumerate
//! shape-parameter candidates for the fit backend (`cartesian`). The grid
//! search is deterministic given the same inputs, which keeps fits reproducible.

use crate::error::ScanError;

/// Generate `num` evenly spaced points between `start` and `stop` (inclusive).
///
/// `num == 1` yields `[start]`.
pub fn lin_space(start: f64, stop: f64, num: usize) -> Result<Vec<f64>, ScanError> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(ScanError::config(format!(
            "Invalid linear range: start={start}, stop={stop} (must be finite)."
        )));
    }
    if num == 0 {
        return Err(ScanError::config("Number of points must be >= 1."));
    }
    if num == 1 {
        return Ok(vec![start]);
    }

    let step = (stop - start) / (num as f64 - 1.0);
    Ok((0..num).map(|i| start + step * i as f64).collect())
}

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, ScanError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(ScanError::config(format!(
            "Invalid log range: min={min}, max={max} (must be finite, >0, and max>min)."
        )));
    }
    if steps < 2 {
        return Err(ScanError::config("Log steps must be >= 2."));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    Ok((0..steps).map(|i| (ln_min + step * i as f64).exp()).collect())
}

/// Cartesian product of per-axis value lists, last axis varying fastest.
///
/// An empty `axes` slice yields a single empty tuple.
pub fn cartesian(axes: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut out: Vec<Vec<f64>> = vec![Vec::with_capacity(axes.len())];
    for values in axes {
        let mut next = Vec::with_capacity(out.len() * values.len());
        for prefix in &out {
            for &v in values {
                let mut tuple = prefix.clone();
                tuple.push(v);
                next.push(tuple);
            }
        }
        out = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lin_space_includes_endpoints() {
        let v = lin_space(-1.0, 1.0, 5).unwrap();
        assert_eq!(v.len(), 5);
        assert!((v[0] + 1.0).abs() < 1e-12);
        assert!((v[2]).abs() < 1e-12);
        assert!((v[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn log_space_includes_endpoints() {
        let v = log_space(0.1, 10.0, 5).unwrap();
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[v.len() - 1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn cartesian_orders_last_axis_fastest() {
        let grid = cartesian(&[vec![1.0, 2.0], vec![10.0, 20.0, 30.0]]);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0], vec![1.0, 10.0]);
        assert_eq!(grid[1], vec![1.0, 20.0]);
        assert_eq!(grid[3], vec![2.0, 10.0]);
        assert_eq!(cartesian(&[]), vec![Vec::<f64>::new()]);
    }
}
