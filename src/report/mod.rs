//! Reporting utilities: residuals against a channel's fit and outlier rankings.

pub mod format;

pub use format::*;

use crate::domain::ChannelResults;
use crate::error::{ScanError, ScanResult};
use crate::fit::FitFunction;

/// One measured cell compared with the fitted curve.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResidual {
    pub index: usize,
    pub x: f64,
    pub mean: f64,
    pub sem: f64,
    pub fitted: f64,
    pub residual: f64,
    /// `residual / sem`, when the SEM is non-zero.
    pub pull: Option<f64>,
}

/// Largest residuals on each side of the fit (top-N each).
#[derive(Debug, Clone, Default)]
pub struct Outliers {
    pub above: Vec<PointResidual>,
    pub below: Vec<PointResidual>,
}

/// Residuals of every measured cell against the channel's top-level fit.
///
/// Empty when the channel has no accepted fit.
pub fn compute_residuals(results: &ChannelResults) -> ScanResult<Vec<PointResidual>> {
    let Some(fit) = results.fit.as_ref().filter(|f| f.accepted) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(results.means.len());
    for (index, mean) in results.means.iter().enumerate() {
        let (Some(mean), Some(x)) = (*mean, results.xs.get(index).copied().flatten()) else {
            continue;
        };
        let fitted = FitFunction::eval_fit(fit, x)
            .filter(|y| y.is_finite())
            .ok_or_else(|| ScanError::Fit(format!("non-finite prediction of '{}' at x={x}", fit.model)))?;
        let sem = results.sems.get(index).copied().flatten().unwrap_or(0.0);
        let residual = mean - fitted;
        out.push(PointResidual {
            index,
            x,
            mean,
            sem,
            fitted,
            residual,
            pull: (sem > 0.0).then(|| residual / sem),
        });
    }
    Ok(out)
}

/// Rank the points furthest above and below the fit.
pub fn rank_outliers(residuals: &[PointResidual], top_n: usize) -> Outliers {
    let mut sorted = residuals.to_vec();
    sorted.sort_by(|a, b| b.residual.total_cmp(&a.residual));
    let above = sorted
        .iter()
        .filter(|r| r.residual > 0.0)
        .take(top_n)
        .cloned()
        .collect();
    let below = sorted
        .iter()
        .rev()
        .filter(|r| r.residual < 0.0)
        .take(top_n)
        .cloned()
        .collect();
    Outliers { above, below }
}
