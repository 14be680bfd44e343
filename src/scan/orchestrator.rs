//! The scan state machine.
//!
//! ```text
//! Init → Warmup → Measuring ⇄ Paused
//!                    │
//!                    ▼
//!               Finalizing → Fitting → Done
//! (any) → Terminated
//! ```
//!
//! Suspension is a return value: `run` hands back a [`RunOutcome`] and the
//! traversal and statistics stay inside the `Scan`, so `run(true)` continues
//! exactly where the previous call stopped.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::domain::{
    ChannelResults, CheckGranularity, FitResult, IterationState, Point, PrefixFit, RunOutcome, ScanSettings, ScanState,
};
use crate::error::{ScanError, ScanResult};
use crate::fit::{FitBackend, FitOverrides, FitPipeline, MainFitSource, extract_main_fit};
use crate::iter::{PointTraversal, StalePoint, Step, traversal_for};
use crate::models::{ModelEntry, ModelRegistry};
use crate::recovery::{ChannelSamples, CheckContext, Reacquisition, RecoveryHook, RecoverySignal, RecoveryState};
use crate::scan::Collaborators;
use crate::space::PointSpace;
use crate::stats::StatAggregator;

/// One value derived by a calculating model at an outer-grid position.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Derived {
    x: f64,
    value: f64,
    error: f64,
}

#[derive(Debug)]
pub struct Scan {
    space: PointSpace,
    settings: ScanSettings,
    registry: ModelRegistry,
    channels: Vec<String>,
    traversal: Box<dyn PointTraversal>,
    stats: StatAggregator,
    pipeline: FitPipeline,
    recovery: Option<RecoveryHook>,
    state: ScanState,
    /// Point actually used for each index (offset applied).
    recorded: Vec<Option<Point>>,
    /// Samples of the current point in the current pass, per channel.
    point_samples: Vec<Vec<f64>>,
    fits: BTreeMap<String, Vec<PrefixFit>>,
    derived: BTreeMap<String, BTreeMap<Vec<usize>, Derived>>,
    overrides: BTreeMap<String, FitOverrides>,
    datasets: BTreeMap<String, f64>,
}

impl Scan {
    pub fn new(space: PointSpace, settings: ScanSettings, registry: ModelRegistry) -> ScanResult<Self> {
        let traversal = traversal_for(&space, &settings)?;
        registry.check_topology(space.ndim())?;
        let channels: Vec<String> = registry.channels_for_measurement().map(str::to_string).collect();
        if channels.is_empty() {
            return Err(ScanError::config("no measurement channels registered"));
        }
        let point_samples = vec![Vec::new(); channels.len()];
        Ok(Self {
            space,
            settings,
            registry,
            channels,
            traversal,
            stats: StatAggregator::new(),
            pipeline: FitPipeline::default(),
            recovery: None,
            state: ScanState::Init,
            recorded: Vec::new(),
            point_samples,
            fits: BTreeMap::new(),
            derived: BTreeMap::new(),
            overrides: BTreeMap::new(),
            datasets: BTreeMap::new(),
        })
    }

    pub fn with_recovery(mut self, hook: RecoveryHook) -> Self {
        self.recovery = Some(hook);
        self
    }

    pub fn with_backend(mut self, backend: Box<dyn FitBackend>) -> Self {
        self.pipeline = FitPipeline::new(backend);
        self
    }

    /// Per-call fit overrides for one model.
    pub fn set_fit_overrides(&mut self, model: &str, overrides: FitOverrides) -> ScanResult<()> {
        let entry = self
            .registry
            .get(model)
            .ok_or_else(|| ScanError::UnknownModel(model.to_string()))?;
        if entry.fit.is_none() {
            return Err(ScanError::config(format!("model '{model}' does not fit")));
        }
        self.overrides.insert(model.to_string(), overrides);
        Ok(())
    }

    /// Shift every point emitted from now on (cumulative).
    pub fn offset_points(&mut self, x_offset: f64) {
        self.traversal.offset_points(x_offset);
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn iteration(&self) -> &IterationState {
        self.traversal.state()
    }

    pub fn stats(&self) -> &StatAggregator {
        &self.stats
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn space(&self) -> &PointSpace {
        &self.space
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn recovery_state(&self) -> Option<RecoveryState> {
        self.recovery.as_ref().map(RecoveryHook::state)
    }

    /// Saved main-fit values.
    pub fn datasets(&self) -> &BTreeMap<String, f64> {
        &self.datasets
    }

    pub fn recorded_point(&self, index: usize) -> Option<&Point> {
        self.recorded.get(index).and_then(Option::as_ref)
    }

    /// Every fit of a model, one per outer prefix.
    pub fn fits_for(&self, model: &str) -> &[PrefixFit] {
        self.fits.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The model's top-level fit (empty prefix).
    pub fn fit_result(&self, model: &str) -> Option<&FitResult> {
        self.fits_for(model)
            .iter()
            .find(|f| f.prefix.is_empty())
            .map(|f| &f.fit)
    }

    /// Main-fit value of a model, read from its fit or from saved datasets.
    pub fn main_fit(&self, model: &str, source: MainFitSource) -> Option<(String, f64)> {
        let entry = self.registry.get(model)?;
        let main = entry.fit.as_ref()?.main_fit.as_ref()?;
        extract_main_fit(&entry.channel, main, self.fit_result(model), source, &self.datasets)
    }

    /// Drive the scan until it completes, pauses or is terminated.
    ///
    /// `resume = false` re-initializes; `resume = true` continues a paused
    /// run at the current traversal position.
    pub fn run(&mut self, resume: bool, collab: &mut Collaborators<'_>) -> ScanResult<RunOutcome> {
        if resume {
            if self.state != ScanState::Paused {
                return Err(ScanError::InvalidState(format!(
                    "cannot resume a scan in state {:?}",
                    self.state
                )));
            }
            if let Some(hook) = self.recovery.as_mut().filter(|h| h.is_blocked()) {
                match hook.reacquire() {
                    Ok(Reacquisition::Acquired) => info!("resource reacquired on resume"),
                    Ok(Reacquisition::Blocked { .. }) => {
                        collab.yield_run();
                        return Ok(RunOutcome::Paused);
                    }
                    Err(err) => {
                        self.state = ScanState::Terminated;
                        return Err(err);
                    }
                }
            }
            info!(point = self.traversal.state().i_point, pass = self.traversal.state().i_pass, "resuming scan");
            self.state = if self.traversal.state().warming_up {
                ScanState::Warmup
            } else {
                ScanState::Measuring
            };
        } else {
            self.initialize()?;
        }

        let outcome = self.drive(collab);
        if outcome.is_err() {
            self.state = ScanState::Terminated;
        }
        outcome
    }

    /// Rewind `num_points` points, discard their statistics and resume.
    ///
    /// Works on a paused or finished scan; a finished scan drops its fits
    /// and measures the rewound points again.
    pub fn rewind_and_resume(&mut self, num_points: usize, collab: &mut Collaborators<'_>) -> ScanResult<RunOutcome> {
        match self.state {
            ScanState::Paused => {}
            ScanState::Done => {
                self.fits.clear();
                self.derived.clear();
                self.state = ScanState::Paused;
            }
            other => {
                return Err(ScanError::InvalidState(format!("cannot rewind a scan in state {other:?}")));
            }
        }
        let stale = self.rewind(num_points);
        info!(num_points, ?stale, "rewound by request");
        self.run(true, collab)
    }

    fn initialize(&mut self) -> ScanResult<()> {
        let offset = self.traversal.offset();
        self.traversal = traversal_for(&self.space, &self.settings)?;
        if offset != 0.0 {
            self.traversal.offset_points(offset);
        }
        self.stats.clear();
        self.recorded = vec![None; self.space.npoints().unwrap_or(0)];
        self.point_samples.iter_mut().for_each(Vec::clear);
        self.fits.clear();
        self.derived.clear();
        if let Some(hook) = self.recovery.as_mut() {
            hook.reset();
        }

        let s = self.traversal.state();
        info!(
            npoints = ?s.npoints,
            npasses = ?s.npasses,
            nrepeats = s.nrepeats,
            nwarmup = s.nwarmup,
            channels = ?self.channels,
            "scan initialized"
        );
        self.state = if s.warming_up {
            ScanState::Warmup
        } else {
            ScanState::Measuring
        };
        Ok(())
    }

    fn drive(&mut self, collab: &mut Collaborators<'_>) -> ScanResult<RunOutcome> {
        loop {
            match self.state {
                ScanState::Init => self.initialize()?,
                ScanState::Warmup => self.warmup(collab)?,
                ScanState::Measuring => {
                    if let Some(outcome) = self.measure_point(collab)? {
                        return Ok(outcome);
                    }
                }
                ScanState::Finalizing => {
                    info!(repeats = self.traversal.state().i, "measurement finished");
                    self.state = ScanState::Fitting;
                }
                ScanState::Fitting => {
                    self.fit_all(collab)?;
                    self.state = ScanState::Done;
                    info!("scan done");
                }
                ScanState::Done => return Ok(RunOutcome::Completed),
                ScanState::Paused => return Ok(RunOutcome::Paused),
                ScanState::Terminated => return Ok(RunOutcome::Terminated),
            }
        }
    }

    fn warmup(&mut self, collab: &mut Collaborators<'_>) -> ScanResult<()> {
        while let Some(point) = self.traversal.next_warmup_point() {
            let k = self.traversal.state().i_warmup.saturating_sub(1);
            debug!(warmup = k, %point, "warmup point");
            for channel in &self.channels {
                collab
                    .measurement
                    .warmup(&point, channel)
                    .map_err(|source| ScanError::Measurement {
                        channel: channel.clone(),
                        point_index: k,
                        source,
                    })?;
            }
        }
        self.state = ScanState::Measuring;
        Ok(())
    }

    /// Measure every remaining repeat of the current point, then run the
    /// point-boundary checks. `Some` means the run stops here.
    fn measure_point(&mut self, collab: &mut Collaborators<'_>) -> ScanResult<Option<RunOutcome>> {
        if self.traversal.is_finished() {
            self.state = ScanState::Finalizing;
            return Ok(None);
        }

        let index = self.traversal.state().i_point;
        let pass = self.traversal.state().i_pass;
        let point = self.traversal.point_at(index);
        if self.traversal.state().i_repeat == 0 {
            self.point_samples.iter_mut().for_each(Vec::clear);
        }
        self.record(index, &point);

        let step = loop {
            for (c, channel) in self.channels.iter().enumerate() {
                let value = collab
                    .measurement
                    .measure(&point, channel)
                    .map_err(|source| ScanError::Measurement {
                        channel: channel.clone(),
                        point_index: index,
                        source,
                    })?;
                self.stats.add_sample(channel, pass, index, value);
                self.point_samples[c].push(value);
            }
            let step = self.traversal.advance();

            if self.granularity() == Some(CheckGranularity::PerRepeat) {
                if let Some(rewind) = self.check_resource(index, true) {
                    return self.recover(rewind, collab);
                }
            }
            if step.completes_point() {
                break step;
            }
        };

        debug!(index, %point, ?step, "point complete");
        self.mutate_point(index, collab);

        let mut rewound = false;
        if self.granularity() == Some(CheckGranularity::PerPoint) {
            if let Some(rewind) = self.check_resource(index, false) {
                if let Some(outcome) = self.recover(rewind, collab)? {
                    return Ok(Some(outcome));
                }
                rewound = true;
            }
        }

        if !rewound {
            match step {
                // Nothing is left to pause before or cut short, so the last
                // boundary skips the scheduler polls.
                Step::Finished => {
                    self.state = ScanState::Finalizing;
                    return Ok(None);
                }
                Step::NextPass => {
                    info!(pass = self.traversal.state().i_pass, "pass complete");
                    if self.settings.fit_each_pass {
                        self.fit_all(collab)?;
                    }
                }
                Step::NextPoint | Step::Repeat => {}
            }
        }

        if collab.check_pause() {
            collab.yield_run();
            self.state = ScanState::Paused;
            info!(next_point = self.traversal.state().i_point, "scan paused");
            return Ok(Some(RunOutcome::Paused));
        }
        if collab.request_termination() {
            if self.space.is_continuous() {
                info!("termination requested, finalizing continuous scan");
                self.state = ScanState::Finalizing;
                return Ok(None);
            }
            warn!(point = index, "scan terminated");
            self.state = ScanState::Terminated;
            return Ok(Some(RunOutcome::Terminated));
        }
        Ok(None)
    }

    fn granularity(&self) -> Option<CheckGranularity> {
        self.recovery.as_ref().map(RecoveryHook::granularity)
    }

    fn record(&mut self, index: usize, point: &Point) {
        if self.recorded.len() <= index {
            self.recorded.resize(index + 1, None);
        }
        self.recorded[index] = Some(point.clone());
    }

    fn mutate_point(&self, index: usize, collab: &mut Collaborators<'_>) {
        for entry in self.registry.entries().iter().filter(|e| e.aggregates && e.mutates_plot) {
            let cell = self.stats.cell(&entry.channel, index);
            if let (Some(mean), Some(sem)) = (cell.mean(), cell.sem()) {
                collab.mutate(&entry.channel, index, mean, sem);
            }
        }
    }

    /// Consult the hook; `Some(n)` when the resource must be reacquired.
    fn check_resource(&mut self, index: usize, last_repeat_only: bool) -> Option<usize> {
        let hook = self.recovery.as_mut()?;
        let samples: Vec<ChannelSamples<'_>> = self
            .channels
            .iter()
            .zip(&self.point_samples)
            .map(|(channel, values)| ChannelSamples {
                channel,
                values: if last_repeat_only {
                    &values[values.len().saturating_sub(1)..]
                } else {
                    values.as_slice()
                },
            })
            .collect();
        let iteration = self.traversal.state();
        let ctx = CheckContext {
            point_index: index,
            global_repeat: iteration.i.saturating_sub(1),
            iteration,
            samples: &samples,
        };
        match hook.check(&ctx) {
            RecoverySignal::RequestResource { rewind } => Some(rewind),
            RecoverySignal::Continue | RecoverySignal::ResourcePresent => None,
        }
    }

    /// Rewind and reacquire. `Some(Paused)` when reacquisition is blocked.
    fn recover(&mut self, rewind: usize, collab: &mut Collaborators<'_>) -> ScanResult<Option<RunOutcome>> {
        if let Some(hook) = self.recovery.as_mut() {
            hook.begin_rewind();
        }
        let stale = self.rewind(rewind);
        info!(rewind, ?stale, resume_point = self.traversal.state().i_point, "resource lost, rewound");

        let Some(hook) = self.recovery.as_mut() else {
            return Ok(None);
        };
        match hook.reacquire()? {
            Reacquisition::Acquired => {
                info!("resource reacquired");
                Ok(None)
            }
            Reacquisition::Blocked { reason } => {
                warn!(%reason, "reacquisition blocked, suspending scan");
                collab.yield_run();
                self.state = ScanState::Paused;
                Ok(Some(RunOutcome::Paused))
            }
        }
    }

    fn rewind(&mut self, num_points: usize) -> Vec<StalePoint> {
        let stale = self.traversal.rewind(num_points);
        for p in &stale {
            for channel in &self.channels {
                self.stats.reset(channel, p.pass, p.index);
            }
        }
        self.point_samples.iter_mut().for_each(Vec::clear);
        stale
    }

    /// Run every fit, innermost dimension first.
    fn fit_all(&mut self, collab: &mut Collaborators<'_>) -> ScanResult<()> {
        self.fits.clear();
        self.derived.clear();

        for dimension in (0..self.space.ndim()).rev() {
            let entries: Vec<ModelEntry> = self.registry.entries_for(dimension).cloned().collect();
            for entry in entries.iter().filter(|e| e.calculates()) {
                self.calculate(entry, dimension, collab);
            }
            for entry in entries.iter().filter(|e| e.fits()) {
                self.fit_entry(entry, dimension)?;
            }
        }
        Ok(())
    }

    /// Index prefixes selecting each series along `dimension`.
    fn prefixes(&self, dimension: usize) -> Vec<Vec<usize>> {
        match self.space.dims() {
            Some(dims) => index_prefixes(&dims[..dimension]),
            None => vec![Vec::new()],
        }
    }

    fn fit_entry(&mut self, entry: &ModelEntry, dimension: usize) -> ScanResult<()> {
        let Some(spec) = &entry.fit else {
            return Ok(());
        };
        // A calculation blocked by a rejected source already recorded its outcome.
        if self.fits.contains_key(&entry.name) {
            return Ok(());
        }

        let overrides = self.overrides.get(&entry.name).cloned().unwrap_or_default();
        let mut fits = Vec::new();
        for prefix in self.prefixes(dimension) {
            let (xs, means, sems) = if entry.aggregates {
                self.measured_series(&entry.channel, &prefix)
            } else {
                self.derived_series(&entry.name, &prefix, dimension)
            };
            let fit = self
                .pipeline
                .fit_and_validate(&entry.name, &xs, &means, &sems, spec, &overrides)?;
            debug!(model = %entry.name, ?prefix, accepted = fit.accepted, "fitted");
            fits.push(PrefixFit { prefix, fit });
        }

        if let (Some(main), Some(top)) = (&spec.main_fit, fits.iter().find(|f| f.prefix.is_empty())) {
            if let Some((name, value)) =
                extract_main_fit(&entry.channel, main, Some(&top.fit), MainFitSource::Fit, &self.datasets)
            {
                info!(model = %entry.name, dataset = %name, value, "main fit saved");
                self.datasets.insert(name, value);
            }
        }
        self.fits.insert(entry.name.clone(), fits);
        Ok(())
    }

    /// Measured `(x, mean, sem)` along the innermost axis under `prefix`.
    fn measured_series(&self, channel: &str, prefix: &[usize]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let indices: Vec<usize> = match self.space.dims() {
            Some(dims) => {
                let inner = dims[prefix.len()];
                (0..inner)
                    .map(|j| {
                        let mut full = prefix.to_vec();
                        full.push(j);
                        self.space.ravel(&full)
                    })
                    .collect()
            }
            None => (0..self.recorded.len()).collect(),
        };

        let mut xs = Vec::with_capacity(indices.len());
        let mut means = Vec::with_capacity(indices.len());
        let mut sems = Vec::with_capacity(indices.len());
        for index in indices {
            let cell = self.stats.cell(channel, index);
            let (Some(point), Some(mean), Some(sem)) = (self.recorded_point(index), cell.mean(), cell.sem()) else {
                continue;
            };
            xs.push(point.innermost());
            means.push(mean);
            sems.push(sem);
        }
        (xs, means, sems)
    }

    /// Derived `(x, value, error)` along `dimension` under `prefix`.
    fn derived_series(&self, model: &str, prefix: &[usize], dimension: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut xs = Vec::new();
        let mut values = Vec::new();
        let mut errors = Vec::new();
        let Some(table) = self.derived.get(model) else {
            return (xs, values, errors);
        };
        let len = self
            .space
            .dims()
            .and_then(|d| d.get(dimension).copied())
            .unwrap_or(0);
        for j in 0..len {
            let mut key = prefix.to_vec();
            key.push(j);
            if let Some(d) = table.get(&key) {
                xs.push(d.x);
                values.push(d.value);
                errors.push(d.error);
            }
        }
        (xs, values, errors)
    }

    /// Read one value per source fit. A strict rejection in the source
    /// blocks the whole entry.
    fn calculate(&mut self, entry: &ModelEntry, dimension: usize, collab: &mut Collaborators<'_>) {
        let Some(calc) = &entry.calculation else {
            return;
        };
        let source_fits = self.fits_for(&calc.source).to_vec();

        if source_fits.iter().any(|f| f.fit.bad_fit) {
            warn!(model = %entry.name, source = %calc.source, "source fit rejected, skipping calculation");
            let function = entry.fit.as_ref().map_or("", |s| s.function.name());
            let reason = format!("depends on rejected fit of '{}'", calc.source);
            let blocked = self
                .prefixes(dimension)
                .into_iter()
                .map(|prefix| {
                    let mut fit = FitResult::rejected(&entry.name, function, reason.clone());
                    // Propagates to anything calculated from this entry.
                    fit.bad_fit = true;
                    PrefixFit { prefix, fit }
                })
                .collect();
            self.fits.insert(entry.name.clone(), blocked);
            return;
        }

        let source_spec = self.registry.get(&calc.source).and_then(|s| s.fit.clone());
        let param = match (&calc.param, source_spec.as_ref().and_then(|s| s.main_fit.as_ref())) {
            (Some(p), _) => p.clone(),
            (None, Some(main)) => main.param().to_string(),
            (None, None) => return,
        };
        let axis = self.space.axis_values(dimension).map(<[f64]>::to_vec).unwrap_or_default();

        let mut table = BTreeMap::new();
        for pf in source_fits.iter().filter(|f| f.fit.accepted) {
            let (Some(value), Some(&x)) = (pf.fit.field(&param), pf.prefix.get(dimension).and_then(|&i| axis.get(i)))
            else {
                continue;
            };
            let error = pf.fit.error(&param).unwrap_or(0.0);
            table.insert(pf.prefix.clone(), Derived { x, value, error });
        }
        debug!(model = %entry.name, values = table.len(), "calculated");

        if entry.mutates_plot {
            let dims = self.space.dims().unwrap_or_default();
            for (prefix, d) in &table {
                collab.mutate(&entry.channel, flat_index(&dims, prefix), d.value, d.error);
            }
        }
        self.derived.insert(entry.name.clone(), table);
    }

    /// Means, SEMs and fits of a measured or calculated channel.
    pub fn get_results(&self, channel: &str) -> ScanResult<ChannelResults> {
        let models: Vec<&ModelEntry> = self
            .registry
            .entries()
            .iter()
            .filter(|e| e.channel == channel)
            .collect();
        if models.is_empty() {
            return Err(ScanError::UnknownChannel(channel.to_string()));
        }

        let fits: Vec<PrefixFit> = models
            .iter()
            .flat_map(|m| self.fits_for(&m.name).iter().cloned())
            .collect();
        let fit = models.iter().find_map(|m| self.fit_result(&m.name).cloned());

        if self.channels.iter().any(|c| c == channel) {
            let n = self.recorded.len();
            let cells: Vec<_> = (0..n).map(|i| self.stats.cell(channel, i)).collect();
            return Ok(ChannelResults {
                channel: channel.to_string(),
                xs: (0..n).map(|i| self.recorded_point(i).map(Point::innermost)).collect(),
                means: cells.iter().map(|c| c.mean()).collect(),
                sems: cells.iter().map(|c| c.sem()).collect(),
                counts: cells.iter().map(|c| c.count).collect(),
                fit,
                fits,
            });
        }

        // Calculated channel: one cell per outer position.
        let model = models[0];
        let dims = self.space.dims().unwrap_or_default();
        let table = self.derived.get(&model.name);
        let prefixes = index_prefixes(&dims[..(model.dimension + 1).min(dims.len())]);
        let cells: Vec<Option<&Derived>> = prefixes.iter().map(|p| table.and_then(|t| t.get(p))).collect();
        Ok(ChannelResults {
            channel: channel.to_string(),
            xs: cells.iter().map(|c| c.map(|d| d.x)).collect(),
            means: cells.iter().map(|c| c.map(|d| d.value)).collect(),
            sems: cells.iter().map(|c| c.map(|d| d.error)).collect(),
            counts: cells.iter().map(|c| u64::from(c.is_some())).collect(),
            fit,
            fits,
        })
    }
}

/// Every index tuple over `dims`, row-major.
fn index_prefixes(dims: &[usize]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    for &n in dims {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                (0..n).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    out
}

/// Row-major flat index of a (possibly partial) index tuple over `dims`.
fn flat_index(dims: &[usize], indices: &[usize]) -> usize {
    indices
        .iter()
        .zip(dims)
        .fold(0, |acc, (&i, &n)| acc * n + i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{FitFunction, FitSpec};
    use crate::scan::{MutationLog, NoInterrupts, Scheduler};

    fn flat_scan(values: Vec<f64>, settings: ScanSettings) -> Scan {
        let mut registry = ModelRegistry::new();
        registry.register(ModelEntry::measurement("raw", "pmt")).unwrap();
        Scan::new(PointSpace::flat(values).unwrap(), settings, registry).unwrap()
    }

    #[test]
    fn index_prefixes_are_row_major() {
        assert_eq!(index_prefixes(&[]), vec![Vec::<usize>::new()]);
        assert_eq!(
            index_prefixes(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(flat_index(&[2, 3], &[1, 2]), 5);
        assert_eq!(flat_index(&[2, 3], &[1]), 1);
    }

    #[test]
    fn every_cell_gets_passes_times_repeats_samples() {
        let settings = ScanSettings {
            npasses: 3,
            nrepeats: 2,
            ..ScanSettings::default()
        };
        let mut scan = flat_scan(vec![0.0, 1.0, 2.0, 3.0], settings);
        let mut calls = 0usize;
        let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> {
            calls += 1;
            Ok(1.0)
        };
        let mut collab = Collaborators::new(&mut measure);
        assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
        drop(collab);
        assert_eq!(calls, 3 * 4 * 2);
        for i in 0..4 {
            assert_eq!(scan.stats().count("pmt", i), 6);
        }
        assert_eq!(scan.state(), ScanState::Done);
    }

    #[test]
    fn resume_requires_paused_state() {
        let mut scan = flat_scan(vec![0.0], ScanSettings::default());
        let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> { Ok(0.0) };
        let mut collab = Collaborators::new(&mut measure);
        let err = scan.run(true, &mut collab).unwrap_err();
        assert!(matches!(err, ScanError::InvalidState(_)));
    }

    #[test]
    fn measurement_error_terminates_the_run() {
        let mut scan = flat_scan(vec![0.0, 1.0], ScanSettings::default());
        let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> {
            if p.innermost() > 0.5 {
                anyhow::bail!("detector offline");
            }
            Ok(1.0)
        };
        let mut collab = Collaborators::new(&mut measure);
        let err = scan.run(false, &mut collab).unwrap_err();
        assert!(matches!(err, ScanError::Measurement { point_index: 1, .. }));
        assert_eq!(scan.state(), ScanState::Terminated);
    }

    #[test]
    fn terminate_request_stops_finite_scan() {
        struct StopNow;
        impl Scheduler for StopNow {
            fn request_termination(&mut self) -> bool {
                true
            }
        }
        let mut scan = flat_scan(vec![0.0, 1.0, 2.0], ScanSettings::default());
        let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> { Ok(0.0) };
        let mut stop = StopNow;
        let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut stop);
        assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Terminated);
        assert_eq!(scan.state(), ScanState::Terminated);
        assert_eq!(scan.stats().count("pmt", 0), 1);
        assert_eq!(scan.stats().count("pmt", 1), 0);
    }

    #[test]
    fn warmup_runs_setup_path_without_statistics() {
        #[derive(Default)]
        struct Counting {
            warmups: usize,
            measures: usize,
        }
        impl crate::scan::Measurement for Counting {
            fn measure(&mut self, _: &Point, _: &str) -> anyhow::Result<f64> {
                self.measures += 1;
                Ok(2.0)
            }
            fn warmup(&mut self, _: &Point, _: &str) -> anyhow::Result<()> {
                self.warmups += 1;
                Ok(())
            }
        }

        let settings = ScanSettings {
            nwarmup: 3,
            nrepeats: 4,
            ..ScanSettings::default()
        };
        let mut scan = flat_scan(vec![0.0, 1.0], settings);
        let mut m = Counting::default();
        let mut scheduler = NoInterrupts;
        let mut collab = Collaborators::new(&mut m).with_scheduler(&mut scheduler);
        scan.run(false, &mut collab).unwrap();
        drop(collab);
        assert_eq!(m.warmups, 3);
        assert_eq!(m.measures, 8);
        assert_eq!(scan.stats().count("pmt", 0), 4);
    }

    #[test]
    fn offset_points_shift_recorded_abscissa() {
        let mut registry = ModelRegistry::new();
        registry
            .register(ModelEntry::measurement("line", "pmt").with_fit(FitSpec::new(FitFunction::Line)))
            .unwrap();
        let mut scan = Scan::new(
            PointSpace::flat(vec![0.0, 1.0, 2.0]).unwrap(),
            ScanSettings::default(),
            registry,
        )
        .unwrap();
        scan.offset_points(10.0);
        let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> { Ok(p.innermost()) };
        let mut log = MutationLog::default();
        let mut collab = Collaborators::new(&mut measure).with_sink(&mut log);
        scan.run(false, &mut collab).unwrap();
        drop(collab);

        let results = scan.get_results("pmt").unwrap();
        assert_eq!(results.xs, vec![Some(10.0), Some(11.0), Some(12.0)]);
        let fit = results.fit.unwrap();
        assert!((fit.param("slope").unwrap() - 1.0).abs() < 1e-9);
        assert!(fit.param("intercept").unwrap().abs() < 1e-9);
        assert_eq!(log.events.len(), 3);
    }

    #[test]
    fn unknown_channel_is_reported() {
        let scan = flat_scan(vec![0.0], ScanSettings::default());
        assert!(matches!(scan.get_results("nope"), Err(ScanError::UnknownChannel(_))));
    }

    #[test]
    fn topology_is_checked_at_construction() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelEntry::measurement("raw", "pmt")).unwrap();
        let grid = PointSpace::grid(vec![vec![0.0, 1.0], vec![0.0, 1.0]]).unwrap();
        let err = Scan::new(grid, ScanSettings::default(), registry).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));

        let empty = Scan::new(PointSpace::flat(vec![0.0]).unwrap(), ScanSettings::default(), ModelRegistry::new());
        assert!(empty.is_err());
    }
}
