//! Running statistics for repeated measurements.
//!
//! Each (channel, point) cell keeps one `count`/`sum`/`sum_sq` triple per pass,
//! so adding a sample is O(1) and a rewind can drop a single pass's
//! contribution. Reads merge every pass; mean and standard error are derived
//! from the merged triple.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// Relative size of the rounding error in `sum_sq - n * mean^2`.
const CANCELLATION_EPS: f64 = 8.0 * f64::EPSILON;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl RunningStats {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn merge(&mut self, other: &RunningStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum / self.count as f64)
    }

    /// Sample (n−1) variance; zero for a single sample.
    ///
    /// Deviations below the cancellation error of `sum_sq` are treated as zero,
    /// which also absorbs floating-point negative-variance artifacts.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        if self.count == 1 {
            return Some(0.0);
        }
        let n = self.count as f64;
        let spread = self.sum_sq - n * mean * mean;
        if spread <= CANCELLATION_EPS * self.sum_sq.abs() {
            return Some(0.0);
        }
        Some(spread / (n - 1.0))
    }

    /// Standard error of the mean.
    pub fn sem(&self) -> Option<f64> {
        let var = self.variance()?;
        Some((var / self.count as f64).sqrt())
    }
}

/// Accumulates samples for every (channel, point index) cell, split by pass.
#[derive(Debug, Clone, Default)]
pub struct StatAggregator {
    /// channel -> point index -> pass -> stats
    cells: HashMap<String, Vec<Vec<RunningStats>>>,
}

impl StatAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, channel: &str, pass: usize, point_index: usize, value: f64) {
        let points = self.cells.entry(channel.to_string()).or_default();
        if points.len() <= point_index {
            points.resize_with(point_index + 1, Vec::new);
        }
        let passes = &mut points[point_index];
        if passes.len() <= pass {
            passes.resize(pass + 1, RunningStats::default());
        }
        passes[pass].add(value);
    }

    /// A cell merged over all passes; empty if it was never touched.
    pub fn cell(&self, channel: &str, point_index: usize) -> RunningStats {
        let mut merged = RunningStats::default();
        if let Some(passes) = self.cells.get(channel).and_then(|points| points.get(point_index)) {
            passes.iter().for_each(|p| merged.merge(p));
        }
        merged
    }

    pub fn count(&self, channel: &str, point_index: usize) -> u64 {
        self.cell(channel, point_index).count
    }

    pub fn mean(&self, channel: &str, point_index: usize) -> ScanResult<f64> {
        self.cell(channel, point_index)
            .mean()
            .ok_or_else(|| no_data(channel, point_index))
    }

    pub fn sem(&self, channel: &str, point_index: usize) -> ScanResult<f64> {
        self.cell(channel, point_index)
            .sem()
            .ok_or_else(|| no_data(channel, point_index))
    }

    /// Drop what one pass contributed to a cell (used on rewind).
    pub fn reset(&mut self, channel: &str, pass: usize, point_index: usize) {
        if let Some(stats) = self
            .cells
            .get_mut(channel)
            .and_then(|points| points.get_mut(point_index))
            .and_then(|passes| passes.get_mut(pass))
        {
            *stats = RunningStats::default();
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

fn no_data(channel: &str, point_index: usize) -> ScanError {
    ScanError::NoData {
        channel: channel.to_string(),
        point_index,
    }
}
