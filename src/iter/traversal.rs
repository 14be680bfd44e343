//! Resumable traversal of a point space.
//!
//! Order is passes (outermost) × points × repeats (innermost). Replaying the
//! same configuration without rewinds visits identical tuples in identical
//! order, so statistics built on top of a traversal are reproducible.
//!
//! The three topologies share one position (`Cursor`) and differ only in how an
//! index resolves to a point and whether the traversal ever ends.

use std::fmt;

use crate::domain::{IterationState, Point, ScanSettings};
use crate::error::ScanResult;
use crate::space::PointSpace;

/// Result of a single `advance()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Another repeat of the same point follows.
    Repeat,
    /// The point is complete; the next point of the same pass follows.
    NextPoint,
    /// The point and its pass are complete; a new pass follows.
    NextPass,
    /// The last pass is complete.
    Finished,
}

/// A (pass, point) pair whose samples a rewind invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StalePoint {
    pub pass: usize,
    pub index: usize,
}

impl Step {
    pub fn completes_point(self) -> bool {
        !matches!(self, Step::Repeat)
    }
}

pub trait PointTraversal: fmt::Debug + Send {
    fn state(&self) -> &IterationState;

    /// Move to the next (pass, point, repeat) tuple.
    fn advance(&mut self) -> Step;

    /// Point at a flat index, with the current offset applied.
    fn point_at(&self, index: usize) -> Point;

    /// Per-axis indices of a flat index.
    fn indices_of(&self, index: usize) -> Vec<usize>;

    /// Yield the next warmup point, clearing `warming_up` once exhausted.
    fn next_warmup_point(&mut self) -> Option<Point>;

    /// Step back `num_points` points and return the (pass, point) pairs whose
    /// samples are now stale, in traversal order. Earlier passes of the same
    /// points are not affected.
    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint>;

    /// Shift every point emitted from now on by `x_offset` (cumulative).
    fn offset_points(&mut self, x_offset: f64);

    fn offset(&self) -> f64;

    fn current_point(&self) -> Point {
        self.point_at(self.state().i_point)
    }

    fn current_indices(&self) -> Vec<usize> {
        self.indices_of(self.state().i_point)
    }

    fn is_finished(&self) -> bool {
        self.state().is_finished()
    }
}

/// Build the traversal strategy matching a point space.
pub fn traversal_for(space: &PointSpace, settings: &ScanSettings) -> ScanResult<Box<dyn PointTraversal>> {
    space.validate()?;
    settings.validate()?;

    let traversal: Box<dyn PointTraversal> = match space {
        PointSpace::Flat { values } => Box::new(FlatSweep::new(values.clone(), settings)),
        PointSpace::Grid { axes } => Box::new(GridSweep::new(axes.clone(), settings)),
        PointSpace::Continuous { start, step } => Box::new(ContinuousSweep::new(*start, *step, settings)),
    };
    Ok(traversal)
}

#[derive(Debug, Clone)]
struct Cursor {
    state: IterationState,
    offset: f64,
}

impl Cursor {
    fn new(npoints: Option<usize>, settings: &ScanSettings) -> Self {
        let npasses = npoints.map(|_| settings.npasses);
        Self {
            state: IterationState::new(npoints, npasses, settings.nrepeats, settings.nwarmup),
            offset: 0.0,
        }
    }

    fn advance(&mut self) -> Step {
        let s = &mut self.state;
        if s.is_finished() {
            return Step::Finished;
        }

        s.i += 1;
        s.i_repeat += 1;
        if s.i_repeat < s.nrepeats {
            return Step::Repeat;
        }

        s.i_repeat = 0;
        s.i_point += 1;
        match s.npoints {
            Some(n) if s.i_point >= n => {
                s.i_point = 0;
                s.i_pass += 1;
                if s.is_finished() {
                    Step::Finished
                } else {
                    Step::NextPass
                }
            }
            _ => Step::NextPoint,
        }
    }

    fn next_warmup_index(&mut self) -> Option<usize> {
        let s = &mut self.state;
        if s.i_warmup >= s.nwarmup {
            s.warming_up = false;
            return None;
        }
        let k = s.i_warmup;
        s.i_warmup += 1;
        Some(k)
    }

    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint> {
        if num_points == 0 {
            return Vec::new();
        }

        let s = &mut self.state;
        // Positions are counted across pass boundaries so a rewind issued right
        // after a pass (or the whole scan) completed still reaches back into it.
        let linear = match s.npoints {
            Some(np) => s.i_pass * np + s.i_point,
            None => s.i_point,
        };
        let target = linear.saturating_sub(num_points);
        // A partly measured current point is re-measured from its first repeat.
        let end = if s.i_repeat > 0 { linear + 1 } else { linear };

        let rolled = (linear - target) as u64 * s.nrepeats as u64 + s.i_repeat as u64;
        s.i = s.i.saturating_sub(rolled);
        s.i_repeat = 0;
        match s.npoints {
            Some(np) => {
                s.i_pass = target / np;
                s.i_point = target % np;
            }
            None => s.i_point = target,
        }

        (target..end)
            .map(|l| match s.npoints {
                Some(np) => StalePoint { pass: l / np, index: l % np },
                None => StalePoint { pass: 0, index: l },
            })
            .collect()
    }
}

/// Finite 1-D sweep over a precomputed list.
#[derive(Debug, Clone)]
pub struct FlatSweep {
    values: Vec<f64>,
    cursor: Cursor,
}

impl FlatSweep {
    pub fn new(values: Vec<f64>, settings: &ScanSettings) -> Self {
        let cursor = Cursor::new(Some(values.len()), settings);
        Self { values, cursor }
    }
}

impl PointTraversal for FlatSweep {
    fn state(&self) -> &IterationState {
        &self.cursor.state
    }

    fn advance(&mut self) -> Step {
        self.cursor.advance()
    }

    fn point_at(&self, index: usize) -> Point {
        Point::Scalar(self.values[index % self.values.len()] + self.cursor.offset)
    }

    fn indices_of(&self, index: usize) -> Vec<usize> {
        vec![index]
    }

    fn next_warmup_point(&mut self) -> Option<Point> {
        self.cursor.next_warmup_index().map(|k| self.point_at(k))
    }

    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint> {
        self.cursor.rewind(num_points)
    }

    fn offset_points(&mut self, x_offset: f64) {
        self.cursor.offset += x_offset;
    }

    fn offset(&self) -> f64 {
        self.cursor.offset
    }
}

/// Finite N-D sweep, row-major with the last axis varying fastest.
#[derive(Debug, Clone)]
pub struct GridSweep {
    space: PointSpace,
    cursor: Cursor,
}

impl GridSweep {
    pub fn new(axes: Vec<Vec<f64>>, settings: &ScanSettings) -> Self {
        let space = PointSpace::Grid { axes };
        let cursor = Cursor::new(space.npoints(), settings);
        Self { space, cursor }
    }
}

impl PointTraversal for GridSweep {
    fn state(&self) -> &IterationState {
        &self.cursor.state
    }

    fn advance(&mut self) -> Step {
        self.cursor.advance()
    }

    fn point_at(&self, index: usize) -> Point {
        self.space.point_at(index).shifted(self.cursor.offset)
    }

    fn indices_of(&self, index: usize) -> Vec<usize> {
        let npoints = self.cursor.state.npoints.unwrap_or(1).max(1);
        self.space.unravel(index % npoints)
    }

    fn next_warmup_point(&mut self) -> Option<Point> {
        self.cursor.next_warmup_index().map(|k| self.point_at(k))
    }

    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint> {
        self.cursor.rewind(num_points)
    }

    fn offset_points(&mut self, x_offset: f64) {
        self.cursor.offset += x_offset;
    }

    fn offset(&self) -> f64 {
        self.cursor.offset
    }
}

/// Unbounded 1-D sweep driven by `start + k * step`; it never finishes on its own.
#[derive(Debug, Clone)]
pub struct ContinuousSweep {
    start: f64,
    step: f64,
    cursor: Cursor,
}

impl ContinuousSweep {
    pub fn new(start: f64, step: f64, settings: &ScanSettings) -> Self {
        Self {
            start,
            step,
            cursor: Cursor::new(None, settings),
        }
    }
}

impl PointTraversal for ContinuousSweep {
    fn state(&self) -> &IterationState {
        &self.cursor.state
    }

    fn advance(&mut self) -> Step {
        self.cursor.advance()
    }

    fn point_at(&self, index: usize) -> Point {
        Point::Scalar(self.start + self.step * index as f64 + self.cursor.offset)
    }

    fn indices_of(&self, index: usize) -> Vec<usize> {
        vec![index]
    }

    fn next_warmup_point(&mut self) -> Option<Point> {
        self.cursor.next_warmup_index().map(|k| self.point_at(k))
    }

    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint> {
        self.cursor.rewind(num_points)
    }

    fn offset_points(&mut self, x_offset: f64) {
        self.cursor.offset += x_offset;
    }

    fn offset(&self) -> f64 {
        self.cursor.offset
    }
}
