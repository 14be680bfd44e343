use std::collections::VecDeque;

use rep_scan::domain::{Point, RunOutcome, ScanSettings, ScanState};
use rep_scan::fit::{Check, FitFunction, FitSpec, MainFit, MainFitSource, NamedValidator};
use rep_scan::models::{Calculation, ModelEntry, ModelRegistry};
use rep_scan::recovery::{CheckContext, Reacquisition, RecoveryHook, RecoverySignal, RecoveryState};
use rep_scan::scan::{Collaborators, MutationLog, PointBudget, Scan, Scheduler};
use rep_scan::space::PointSpace;

fn one_channel(entry: ModelEntry) -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register(entry).unwrap();
    registry
}

fn flat(n: usize) -> PointSpace {
    PointSpace::flat((0..n).map(|i| i as f64).collect()).unwrap()
}

/// Pauses at the listed point boundaries (1-based poll counts).
struct PauseAt {
    polls: usize,
    at: Vec<usize>,
    yields: usize,
}

impl Scheduler for PauseAt {
    fn check_pause(&mut self) -> bool {
        self.polls += 1;
        self.at.contains(&self.polls)
    }

    fn yield_run(&mut self) {
        self.yields += 1;
    }
}

#[test]
fn grid_visits_every_point_repeat_and_pass() {
    let settings = ScanSettings {
        npasses: 2,
        nrepeats: 3,
        ..ScanSettings::default()
    };
    let mut registry = ModelRegistry::new();
    registry.register(ModelEntry::measurement("a", "a").at_dimension(1)).unwrap();
    registry.register(ModelEntry::measurement("b", "b").at_dimension(1)).unwrap();
    let space = PointSpace::grid(vec![vec![0.0, 1.0], vec![0.0, 1.0, 2.0]]).unwrap();
    let mut scan = Scan::new(space, settings, registry).unwrap();

    let mut calls = Vec::new();
    let mut measure = |p: &Point, ch: &str| -> anyhow::Result<f64> {
        calls.push((p.clone(), ch.to_string()));
        Ok(1.0)
    };
    let mut collab = Collaborators::new(&mut measure);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);

    assert_eq!(calls.len(), 2 * 6 * 3 * 2);
    // Channels are driven in registration order, last axis fastest.
    assert_eq!(calls[0].1, "a");
    assert_eq!(calls[1].1, "b");
    assert_eq!(calls[6].0, Point::Tuple(vec![0.0, 1.0]));
    for i in 0..6 {
        assert_eq!(scan.stats().count("a", i), 6);
        assert_eq!(scan.stats().count("b", i), 6);
    }
}

#[test]
fn constant_measurement_gives_exact_mean_and_zero_sem() {
    let settings = ScanSettings {
        nrepeats: 5,
        ..ScanSettings::default()
    };
    let mut scan = Scan::new(flat(10), settings, one_channel(ModelEntry::measurement("m", "pmt"))).unwrap();
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> { Ok(3.0) };
    scan.run(false, &mut Collaborators::new(&mut measure)).unwrap();

    for i in 0..10 {
        assert_eq!(scan.stats().mean("pmt", i).unwrap(), 3.0);
        assert_eq!(scan.stats().sem("pmt", i).unwrap(), 0.0);
    }
}

#[test]
fn two_point_sweep_means_and_sems() {
    let settings = ScanSettings {
        nrepeats: 2,
        ..ScanSettings::default()
    };
    let mut scan = Scan::new(flat(2), settings, one_channel(ModelEntry::measurement("m", "pmt"))).unwrap();
    let mut values: VecDeque<f64> = VecDeque::from(vec![1.0, 3.0, 5.0, 7.0]);
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> {
        values.pop_front().ok_or_else(|| anyhow::anyhow!("out of values"))
    };
    scan.run(false, &mut Collaborators::new(&mut measure)).unwrap();

    let results = scan.get_results("pmt").unwrap();
    assert_eq!(results.means, vec![Some(2.0), Some(6.0)]);
    for sem in results.sems {
        assert!((sem.unwrap() - 1.0).abs() < 1e-12);
    }
    assert_eq!(results.counts, vec![2, 2]);
}

#[test]
fn lost_resource_rewinds_and_discards_stale_points() {
    let mut fired = false;
    let check = move |ctx: &CheckContext<'_>| {
        if !fired && ctx.global_repeat == 7 {
            fired = true;
            RecoverySignal::RequestResource { rewind: 3 }
        } else {
            RecoverySignal::ResourcePresent
        }
    };
    let mut blocked_once = true;
    let reacquire = move || -> anyhow::Result<Reacquisition> {
        if std::mem::take(&mut blocked_once) {
            Ok(Reacquisition::Blocked {
                reason: "too many recent attempts".into(),
            })
        } else {
            Ok(Reacquisition::Acquired)
        }
    };

    let mut scan = Scan::new(flat(10), ScanSettings::default(), one_channel(ModelEntry::measurement("m", "pmt")))
        .unwrap()
        .with_recovery(RecoveryHook::new(check, reacquire));

    // Values before the loss are 100, values after are 1.
    let mut calls = 0usize;
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> {
        calls += 1;
        Ok(if calls <= 8 { 100.0 } else { 1.0 })
    };
    let mut scheduler = PauseAt {
        polls: 0,
        at: Vec::new(),
        yields: 0,
    };

    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Paused);
    assert_eq!(scan.state(), ScanState::Paused);
    assert_eq!(scan.recovery_state(), Some(RecoveryState::Blocked));
    assert_eq!(scan.iteration().i_point, 5);
    assert_eq!(scan.iteration().i, 5);
    for i in 0..5 {
        assert_eq!(scan.stats().count("pmt", i), 1);
    }
    for i in 5..8 {
        assert_eq!(scan.stats().count("pmt", i), 0);
    }

    assert_eq!(scan.run(true, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);
    assert_eq!(scheduler.yields, 1);
    assert_eq!(calls, 13);
    for i in 0..5 {
        assert_eq!(scan.stats().mean("pmt", i).unwrap(), 100.0);
    }
    for i in 5..10 {
        assert_eq!(scan.stats().count("pmt", i), 1);
        assert_eq!(scan.stats().mean("pmt", i).unwrap(), 1.0);
    }
}

#[test]
fn pause_and_resume_keep_traversal_order() {
    let settings = ScanSettings {
        npasses: 2,
        nrepeats: 2,
        ..ScanSettings::default()
    };
    let record = |scan: &mut Scan, pause_at: Vec<usize>| -> Vec<f64> {
        let mut seen = Vec::new();
        let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> {
            seen.push(p.innermost());
            Ok(0.0)
        };
        let mut scheduler = PauseAt {
            polls: 0,
            at: pause_at,
            yields: 0,
        };
        let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);
        let mut outcome = scan.run(false, &mut collab).unwrap();
        while outcome == RunOutcome::Paused {
            outcome = scan.run(true, &mut collab).unwrap();
        }
        assert_eq!(outcome, RunOutcome::Completed);
        drop(collab);
        seen
    };

    let registry = one_channel(ModelEntry::measurement("m", "pmt"));
    let mut straight = Scan::new(flat(5), settings.clone(), registry.clone()).unwrap();
    let mut paused = Scan::new(flat(5), settings, registry).unwrap();

    let expected = record(&mut straight, Vec::new());
    let got = record(&mut paused, vec![3, 7]);
    assert_eq!(got, expected);
    assert_eq!(got.len(), 2 * 5 * 2);
    // Pausing after point 2 resumes at point 3.
    assert_eq!(&got[4..8], &[2.0, 2.0, 3.0, 3.0]);
}

#[test]
fn paused_scan_reports_next_point() {
    let mut scan = Scan::new(flat(6), ScanSettings::default(), one_channel(ModelEntry::measurement("m", "pmt"))).unwrap();
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> { Ok(0.0) };
    let mut scheduler = PauseAt {
        polls: 0,
        at: vec![3],
        yields: 0,
    };
    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Paused);
    assert_eq!(scan.iteration().i_point, 3);
    assert_eq!(scan.stats().count("pmt", 2), 1);
    assert_eq!(scan.stats().count("pmt", 3), 0);
}

fn slope_grid(validator: NamedValidator) -> Scan {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            ModelEntry::measurement("inner", "pmt")
                .at_dimension(1)
                .with_fit(FitSpec::new(FitFunction::Line).with_validator(validator)),
        )
        .unwrap();
    registry
        .register(
            ModelEntry::calculated(
                "slopes",
                "pmt.slope",
                Calculation {
                    source: "inner".into(),
                    param: Some("slope".into()),
                },
            )
            .with_fit(FitSpec::new(FitFunction::Line).with_main_fit(MainFit::Param("slope".into()))),
        )
        .unwrap();
    let space = PointSpace::grid(vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0, 3.0]]).unwrap();
    Scan::new(space, ScanSettings::default(), registry).unwrap()
}

fn run_slope_grid(scan: &mut Scan) -> MutationLog {
    // Row `o` is the line `(o + 1) * x + o`.
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> {
        let (o, x) = (p.coord(0).unwrap_or(0.0), p.innermost());
        Ok((o + 1.0) * x + o)
    };
    let mut log = MutationLog::default();
    let mut collab = Collaborators::new(&mut measure).with_sink(&mut log);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);
    log
}

#[test]
fn outer_calculation_reads_completed_inner_fits() {
    let lenient = NamedValidator::new(
        "gentle",
        Check::Between {
            field: "slope".into(),
            min: None,
            max: Some(2.5),
        },
    );
    let mut scan = slope_grid(lenient);
    let log = run_slope_grid(&mut scan);

    let inner = scan.fits_for("inner");
    assert_eq!(inner.len(), 3);
    assert!(inner[0].fit.accepted && inner[1].fit.accepted);
    assert!(!inner[2].fit.accepted);
    assert!(!inner[2].fit.bad_fit);

    // Only validated inner fits reach the outer axis.
    let derived = scan.get_results("pmt.slope").unwrap();
    assert_eq!(derived.xs, vec![Some(0.0), Some(1.0), None]);
    assert!((derived.means[0].unwrap() - 1.0).abs() < 1e-9);
    assert!((derived.means[1].unwrap() - 2.0).abs() < 1e-9);
    assert!(derived.means[2].is_none());

    let outer = scan.fit_result("slopes").unwrap();
    assert!(outer.accepted);
    assert!((outer.param("slope").unwrap() - 1.0).abs() < 1e-9);
    let (name, value) = scan.main_fit("slopes", MainFitSource::Dataset).unwrap();
    assert_eq!(name, "pmt.slope.slope");
    assert!((value - 1.0).abs() < 1e-9);

    // 12 measured points plus 2 derived outer points.
    assert_eq!(log.for_channel("pmt").count(), 12);
    assert_eq!(log.for_channel("pmt.slope").count(), 2);
}

#[test]
fn strict_inner_rejection_blocks_dependent_calculation() {
    let strict = NamedValidator::new(
        "shallow",
        Check::Between {
            field: "slope".into(),
            min: None,
            max: Some(2.5),
        },
    )
    .strict();
    let mut scan = slope_grid(strict);
    run_slope_grid(&mut scan);

    assert!(scan.fits_for("inner")[2].fit.bad_fit);
    let outer = scan.fit_result("slopes").unwrap();
    assert!(!outer.accepted);
    assert!(outer.validation_failures[0].contains("inner"));
    assert!(scan.datasets().is_empty());
    assert_eq!(scan.state(), ScanState::Done);
}

#[test]
fn continuous_scan_ends_on_termination_and_is_fitted() {
    let registry = one_channel(ModelEntry::measurement("m", "pmt").with_fit(FitSpec::new(FitFunction::Line)));
    let mut scan = Scan::new(PointSpace::continuous(1.0, 0.5).unwrap(), ScanSettings::default(), registry).unwrap();
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> { Ok(2.0 * p.innermost() + 1.0) };
    let mut budget = PointBudget::new(6);
    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut budget);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);

    let results = scan.get_results("pmt").unwrap();
    assert_eq!(results.means.len(), 6);
    assert_eq!(results.xs[5], Some(3.5));
    let fit = results.fit.unwrap();
    assert!((fit.param("slope").unwrap() - 2.0).abs() < 1e-9);
}

#[test]
fn rewind_after_done_remeasures_tail() {
    let registry = one_channel(ModelEntry::measurement("m", "pmt").with_fit(FitSpec::new(FitFunction::Line)));
    let mut scan = Scan::new(flat(5), ScanSettings::default(), registry).unwrap();
    let mut calls = 0usize;
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> {
        calls += 1;
        Ok(p.innermost())
    };
    let mut collab = Collaborators::new(&mut measure);
    scan.run(false, &mut collab).unwrap();
    assert_eq!(scan.rewind_and_resume(2, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);

    assert_eq!(calls, 7);
    for i in 0..5 {
        assert_eq!(scan.stats().count("pmt", i), 1);
    }
    assert!(scan.fit_result("m").unwrap().accepted);
}

#[test]
fn per_repeat_check_rewinds_a_partly_measured_point() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rep_scan::domain::CheckGranularity;

    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);
    let check = move |ctx: &CheckContext<'_>| {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ctx.samples_for("pmt").map(<[f64]>::len), Some(1));
        if n == 4 {
            RecoverySignal::RequestResource { rewind: 1 }
        } else {
            RecoverySignal::ResourcePresent
        }
    };
    let reacquire = || -> anyhow::Result<Reacquisition> { Ok(Reacquisition::Acquired) };
    let hook = RecoveryHook::new(check, reacquire).with_granularity(CheckGranularity::PerRepeat);

    let settings = ScanSettings {
        nrepeats: 3,
        ..ScanSettings::default()
    };
    let mut scan = Scan::new(flat(4), settings, one_channel(ModelEntry::measurement("m", "pmt")))
        .unwrap()
        .with_recovery(hook);
    let mut calls = 0usize;
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> {
        calls += 1;
        Ok(1.0)
    };
    assert_eq!(
        scan.run(false, &mut Collaborators::new(&mut measure)).unwrap(),
        RunOutcome::Completed
    );

    // The fifth repeat sits inside point 1, so points 0 and 1 are measured again.
    assert_eq!(calls, 5 + 12);
    assert_eq!(checks.load(Ordering::SeqCst), 17);
    for i in 0..4 {
        assert_eq!(scan.stats().count("pmt", i), 3);
    }
}

#[test]
fn fit_each_pass_gives_provisional_fits() {
    let settings = ScanSettings {
        npasses: 2,
        fit_each_pass: true,
        ..ScanSettings::default()
    };
    let registry = one_channel(ModelEntry::measurement("m", "pmt").with_fit(FitSpec::new(FitFunction::Line)));
    let mut scan = Scan::new(flat(3), settings, registry).unwrap();
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> { Ok(3.0 * p.innermost()) };
    let mut scheduler = PauseAt {
        polls: 0,
        at: vec![3],
        yields: 0,
    };
    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);

    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Paused);
    assert_eq!(scan.iteration().i_pass, 1);
    let provisional = scan.fit_result("m").unwrap();
    assert!((provisional.param("slope").unwrap() - 3.0).abs() < 1e-9);

    assert_eq!(scan.run(true, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);
    assert_eq!(scan.stats().count("pmt", 0), 2);
    assert!(scan.fit_result("m").unwrap().accepted);
}

#[test]
fn zero_rewind_keeps_paused_statistics() {
    let mut scan = Scan::new(flat(5), ScanSettings::default(), one_channel(ModelEntry::measurement("m", "pmt"))).unwrap();
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> { Ok(p.innermost()) };
    let mut scheduler = PauseAt {
        polls: 0,
        at: vec![2, 3],
        yields: 0,
    };
    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);

    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Paused);
    let before = *scan.iteration();
    assert_eq!(before.i_point, 2);

    assert_eq!(scan.rewind_and_resume(0, &mut collab).unwrap(), RunOutcome::Paused);
    drop(collab);
    assert_eq!(scan.iteration().i_point, before.i_point + 1);
    assert_eq!(scan.iteration().i, before.i + 1);
    for i in 0..3 {
        assert_eq!(scan.stats().count("pmt", i), 1);
        assert_eq!(scan.stats().mean("pmt", i).unwrap(), i as f64);
    }
}

#[test]
fn rewind_in_later_pass_keeps_earlier_pass_samples() {
    let mut fired = false;
    let check = move |ctx: &CheckContext<'_>| {
        if !fired && ctx.iteration.i_pass == 1 && ctx.point_index == 2 {
            fired = true;
            RecoverySignal::RequestResource { rewind: 1 }
        } else {
            RecoverySignal::ResourcePresent
        }
    };
    let reacquire = || -> anyhow::Result<Reacquisition> { Ok(Reacquisition::Acquired) };
    let settings = ScanSettings {
        npasses: 2,
        ..ScanSettings::default()
    };
    let mut scan = Scan::new(flat(4), settings, one_channel(ModelEntry::measurement("m", "pmt")))
        .unwrap()
        .with_recovery(RecoveryHook::new(check, reacquire));

    // Pass 0 reads 10, pass 1 reads 20, and the sample taken while the
    // resource was lost (call 7, point 2 of pass 1) reads 999.
    let mut calls = 0usize;
    let mut measure = |_: &Point, _: &str| -> anyhow::Result<f64> {
        calls += 1;
        Ok(match calls {
            1..=4 => 10.0,
            7 => 999.0,
            _ => 20.0,
        })
    };
    let mut collab = Collaborators::new(&mut measure);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);

    assert_eq!(calls, 9);
    for i in 0..4 {
        assert_eq!(scan.stats().count("pmt", i), 2, "point {i}");
        assert_eq!(scan.stats().mean("pmt", i).unwrap(), 15.0, "point {i}");
    }
}

#[test]
fn last_point_completes_without_scheduler_poll() {
    let mut scan = Scan::new(flat(3), ScanSettings::default(), one_channel(ModelEntry::measurement("m", "pmt"))).unwrap();
    let mut measure = |p: &Point, _: &str| -> anyhow::Result<f64> { Ok(p.innermost()) };
    let mut scheduler = PauseAt {
        polls: 0,
        at: vec![3],
        yields: 0,
    };
    let mut collab = Collaborators::new(&mut measure).with_scheduler(&mut scheduler);
    assert_eq!(scan.run(false, &mut collab).unwrap(), RunOutcome::Completed);
    drop(collab);
    assert_eq!(scheduler.polls, 2);
    assert_eq!(scheduler.yields, 0);
}
