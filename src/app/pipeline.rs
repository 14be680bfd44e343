//! Shared "run a scan file" workflow.
//!
//! scan file -> simulated measurement -> recovery hook -> run/resume loop ->
//! results snapshot
//!
//! The CLI only decides what to print and export.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::data::SimulatedMeasurement;
use crate::domain::RunOutcome;
use crate::error::{ScanError, ScanResult};
use crate::io::config::ScanFile;
use crate::io::results::ResultsFile;
use crate::recovery::{RateLimitedReacquire, RecoveryHook};
use crate::scan::{Collaborators, PointBudget};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: u64,
    /// Point budget; mandatory for continuous scans.
    pub max_points: Option<usize>,
    pub max_resumes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            max_points: None,
            max_resumes: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outcome: RunOutcome,
    pub results: ResultsFile,
    /// How many times a paused run was resumed.
    pub resumes: usize,
}

/// Build the scan described by `file`, drive it against the simulated
/// measurement and snapshot the results.
pub fn run_scan(file: &ScanFile, opts: &RunOptions) -> ScanResult<RunOutput> {
    let sim = file
        .simulation
        .as_ref()
        .ok_or_else(|| ScanError::config("scan file has no simulation section"))?;
    let mut scan = file.build()?;

    if scan.space().is_continuous() && opts.max_points.is_none() {
        return Err(ScanError::config("continuous scans need a point budget (--max-points)"));
    }
    if let Some(missing) = scan
        .channels()
        .iter()
        .find(|c| !sim.signals.iter().any(|s| &s.channel == *c))
    {
        return Err(ScanError::config(format!("no simulated signal for channel '{missing}'")));
    }

    let mut measurement = SimulatedMeasurement::new(sim, opts.seed)?;
    let mut backoff = Duration::ZERO;
    if let Some(recovery) = &file.recovery {
        let window = recovery.window()?;
        let reacquire = RateLimitedReacquire::new(measurement.reload(), recovery.max_attempts, window);
        let hook = RecoveryHook::new(recovery.check.clone(), reacquire).with_granularity(recovery.granularity);
        scan = scan.with_recovery(hook);
        backoff = window;
    }

    let mut budget = opts.max_points.map(PointBudget::new);
    let mut collab = Collaborators::new(&mut measurement);
    if let Some(budget) = budget.as_mut() {
        collab = collab.with_scheduler(budget);
    }

    let mut outcome = scan.run(false, &mut collab)?;
    let mut resumes = 0;
    while outcome == RunOutcome::Paused {
        if resumes >= opts.max_resumes {
            warn!(resumes, "giving up on paused scan");
            break;
        }
        // Reacquisition is rate limited; let the window pass first.
        thread::sleep(backoff);
        resumes += 1;
        info!(resumes, "resuming paused scan");
        outcome = scan.run(true, &mut collab)?;
    }
    drop(collab);

    let results = ResultsFile::from_scan(&scan, outcome)?;
    Ok(RunOutput {
        outcome,
        results,
        resumes,
    })
}
