//! The set of points a scan visits.
//!
//! Three topologies are supported:
//!
//! - `Flat`: a precomputed 1-D sequence
//! - `Grid`: one value list per axis, flattened row-major (last axis fastest)
//! - `Continuous`: an unbounded index-to-point formula `start + k * step`
//!
//! Resolving a flat index to a point is O(1) for every topology.

use serde::{Deserialize, Serialize};

use crate::domain::Point;
use crate::error::{ScanError, ScanResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointSpace {
    Flat { values: Vec<f64> },
    Grid { axes: Vec<Vec<f64>> },
    Continuous { start: f64, step: f64 },
}

impl PointSpace {
    /// A 1-D space over `values` (e.g. the result of `get_scan_points`).
    pub fn flat(values: Vec<f64>) -> ScanResult<Self> {
        check_axis(0, &values)?;
        Ok(PointSpace::Flat { values })
    }

    /// An N-D grid; `axes[0]` is the outermost dimension.
    pub fn grid(axes: Vec<Vec<f64>>) -> ScanResult<Self> {
        if axes.is_empty() {
            return Err(ScanError::config("Grid must have at least one axis."));
        }
        for (i, axis) in axes.iter().enumerate() {
            check_axis(i, axis)?;
        }
        Ok(PointSpace::Grid { axes })
    }

    pub fn continuous(start: f64, step: f64) -> ScanResult<Self> {
        if !(start.is_finite() && step.is_finite()) {
            return Err(ScanError::config("Continuous start/step must be finite."));
        }
        Ok(PointSpace::Continuous { start, step })
    }

    /// Re-validate a deserialized space.
    pub fn validate(&self) -> ScanResult<()> {
        match self {
            PointSpace::Flat { values } => check_axis(0, values),
            PointSpace::Grid { axes } => {
                if axes.is_empty() {
                    return Err(ScanError::config("Grid must have at least one axis."));
                }
                axes.iter().enumerate().try_for_each(|(i, a)| check_axis(i, a))
            }
            PointSpace::Continuous { start, step } => {
                if start.is_finite() && step.is_finite() {
                    Ok(())
                } else {
                    Err(ScanError::config("Continuous start/step must be finite."))
                }
            }
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, PointSpace::Continuous { .. })
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        match self {
            PointSpace::Grid { axes } => axes.len(),
            _ => 1,
        }
    }

    /// Per-axis sizes; `None` for the unbounded topology.
    pub fn dims(&self) -> Option<Vec<usize>> {
        match self {
            PointSpace::Flat { values } => Some(vec![values.len()]),
            PointSpace::Grid { axes } => Some(axes.iter().map(Vec::len).collect()),
            PointSpace::Continuous { .. } => None,
        }
    }

    /// Total number of points; `None` for the unbounded topology.
    pub fn npoints(&self) -> Option<usize> {
        self.dims().map(|d| d.iter().product())
    }

    /// Values of one axis for finite spaces.
    pub fn axis_values(&self, axis: usize) -> Option<&[f64]> {
        match self {
            PointSpace::Flat { values } if axis == 0 => Some(values),
            PointSpace::Grid { axes } => axes.get(axis).map(Vec::as_slice),
            _ => None,
        }
    }

    /// Per-axis indices of a flat index (row-major, last axis fastest).
    pub fn unravel(&self, index: usize) -> Vec<usize> {
        match self {
            PointSpace::Grid { axes } => {
                let mut rem = index;
                let mut out = vec![0; axes.len()];
                for (axis, values) in axes.iter().enumerate().rev() {
                    let n = values.len().max(1);
                    out[axis] = rem % n;
                    rem /= n;
                }
                out
            }
            _ => vec![index],
        }
    }

    /// Flat index of per-axis indices. Missing trailing indices count as 0.
    pub fn ravel(&self, indices: &[usize]) -> usize {
        match self {
            PointSpace::Grid { axes } => {
                let mut flat = 0;
                for (axis, values) in axes.iter().enumerate() {
                    flat = flat * values.len() + indices.get(axis).copied().unwrap_or(0);
                }
                flat
            }
            _ => indices.first().copied().unwrap_or(0),
        }
    }

    /// Point at a flat index. Finite spaces wrap out-of-range indices.
    pub fn point_at(&self, index: usize) -> Point {
        match self {
            PointSpace::Flat { values } => Point::Scalar(values[index % values.len()]),
            PointSpace::Grid { axes } => {
                let npoints: usize = axes.iter().map(Vec::len).product();
                let idx = self.unravel(index % npoints.max(1));
                Point::Tuple(
                    axes.iter()
                        .zip(idx.iter())
                        .map(|(values, &i)| values[i])
                        .collect(),
                )
            }
            PointSpace::Continuous { start, step } => Point::Scalar(start + step * index as f64),
        }
    }
}

fn check_axis(axis: usize, values: &[f64]) -> ScanResult<()> {
    if values.is_empty() {
        return Err(ScanError::config(format!("Axis {axis} has no points.")));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ScanError::config(format!("Axis {axis} contains non-finite points.")));
    }
    Ok(())
}
