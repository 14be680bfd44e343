//! Interfaces the orchestrator drives: measurement, scheduling and plotting.
//!
//! Closures work for the common cases:
//!
//! ```no_run
//! use rep_scan::domain::Point;
//! use rep_scan::scan::{Collaborators, Measurement};
//!
//! let mut measure = |p: &Point, _channel: &str| -> anyhow::Result<f64> { Ok(p.innermost() * 2.0) };
//! let collab = Collaborators::new(&mut measure);
//! # let _ = collab;
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::Point;

/// Produces one value per (point, channel).
pub trait Measurement {
    fn measure(&mut self, point: &Point, channel: &str) -> anyhow::Result<f64>;

    /// Setup-only path run at warmup points; results are discarded.
    fn warmup(&mut self, _point: &Point, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> Measurement for F
where
    F: FnMut(&Point, &str) -> anyhow::Result<f64>,
{
    fn measure(&mut self, point: &Point, channel: &str) -> anyhow::Result<f64> {
        self(point, channel)
    }
}

/// Cooperative scheduling, polled at point boundaries only.
pub trait Scheduler {
    fn check_pause(&mut self) -> bool {
        false
    }

    /// Hand control back before the run suspends.
    fn yield_run(&mut self) {}

    fn request_termination(&mut self) -> bool {
        false
    }
}

/// Never pauses or terminates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupts;

impl Scheduler for NoInterrupts {}

/// Requests termination once `limit` points have completed.
///
/// This is how an unbounded scan is given an end.
#[derive(Debug, Clone, Copy)]
pub struct PointBudget {
    limit: usize,
    completed: usize,
}

impl PointBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, completed: 0 }
    }
}

impl Scheduler for PointBudget {
    fn request_termination(&mut self) -> bool {
        self.completed += 1;
        self.completed >= self.limit
    }
}

/// Receives one notification per completed point per plotting model.
pub trait PlotSink {
    fn mutate(&mut self, channel: &str, point_index: usize, mean: f64, error: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub channel: String,
    pub point_index: usize,
    pub mean: f64,
    pub error: f64,
}

/// Records every mutation in order.
#[derive(Debug, Clone, Default)]
pub struct MutationLog {
    pub events: Vec<Mutation>,
}

impl MutationLog {
    pub fn for_channel<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a Mutation> + 'a {
        self.events.iter().filter(move |m| m.channel == channel)
    }
}

impl PlotSink for MutationLog {
    fn mutate(&mut self, channel: &str, point_index: usize, mean: f64, error: f64) {
        self.events.push(Mutation {
            channel: channel.to_string(),
            point_index,
            mean,
            error,
        });
    }
}

/// Everything a run borrows from its owner.
pub struct Collaborators<'a> {
    pub measurement: &'a mut dyn Measurement,
    pub scheduler: Option<&'a mut dyn Scheduler>,
    pub sink: Option<&'a mut dyn PlotSink>,
}

impl<'a> Collaborators<'a> {
    pub fn new(measurement: &'a mut dyn Measurement) -> Self {
        Self {
            measurement,
            scheduler: None,
            sink: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: &'a mut dyn Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_sink(mut self, sink: &'a mut dyn PlotSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub(crate) fn check_pause(&mut self) -> bool {
        match &mut self.scheduler {
            Some(s) => s.check_pause(),
            None => false,
        }
    }

    pub(crate) fn yield_run(&mut self) {
        if let Some(s) = &mut self.scheduler {
            s.yield_run();
        }
    }

    pub(crate) fn request_termination(&mut self) -> bool {
        match &mut self.scheduler {
            Some(s) => s.request_termination(),
            None => false,
        }
    }

    pub(crate) fn mutate(&mut self, channel: &str, point_index: usize, mean: f64, error: f64) {
        if let Some(sink) = &mut self.sink {
            sink.mutate(channel, point_index, mean, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_budget_terminates_after_limit() {
        let mut budget = PointBudget::new(3);
        assert!(!budget.request_termination());
        assert!(!budget.request_termination());
        assert!(budget.request_termination());
    }

    #[test]
    fn collaborators_forward_to_sink() {
        let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> { Ok(1.0) };
        let mut log = MutationLog::default();
        {
            let mut collab = Collaborators::new(&mut measure).with_sink(&mut log);
            collab.mutate("pmt", 2, 1.5, 0.1);
            assert!(!collab.check_pause());
        }
        assert_eq!(log.for_channel("pmt").count(), 1);
        assert_eq!(log.events[0].point_index, 2);
    }
}
