//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the scan and fit code stays free of presentation
//! - output changes are localized

use crate::domain::{ChannelResults, PrefixFit};
use crate::io::results::ResultsFile;
use crate::report::{Outliers, PointResidual};
use crate::space::PointSpace;

/// Format the run summary: space, settings, outcome, then every channel.
pub fn format_run_summary(results: &ResultsFile) -> String {
    let mut out = String::new();
    let s = &results.settings;

    out.push_str("=== scan - parameterized sweep ===\n");
    out.push_str(&format!("Created: {}\n", results.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
    out.push_str(&format!("Space: {}\n", describe_space(&results.space)));
    out.push_str(&format!(
        "Settings: passes={} repeats={} warmup={} check={:?}{}\n",
        s.npasses,
        s.nrepeats,
        s.nwarmup,
        s.check_granularity,
        if s.fit_each_pass { " fit-each-pass" } else { "" },
    ));
    out.push_str(&format!(
        "Outcome: {:?} (state {:?}) | repeats measured={} | next point={} pass={}\n",
        results.outcome, results.state, results.iteration.i, results.iteration.i_point, results.iteration.i_pass,
    ));

    for ch in &results.channels {
        out.push('\n');
        out.push_str(&format_channel(ch));
    }

    if !results.datasets.is_empty() {
        out.push_str("\nDatasets:\n");
        for (name, value) in &results.datasets {
            out.push_str(&format!("  {name} = {value:.6}\n"));
        }
    }
    out
}

/// Coverage line plus every fit of one channel.
pub fn format_channel(ch: &ChannelResults) -> String {
    let mut out = String::new();
    let measured = ch.counts.iter().filter(|&&c| c > 0).count();
    let (lo, hi) = ch
        .means
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &m| (lo.min(m), hi.max(m)));
    out.push_str(&format!("Channel {}: {measured}/{} cells", ch.channel, ch.means.len()));
    if lo.is_finite() {
        out.push_str(&format!(" | mean=[{lo:.4}, {hi:.4}]"));
    }
    out.push('\n');

    for pf in &ch.fits {
        out.push_str(&format_fit(pf));
    }
    out
}

/// One fit: status line, parameters with errors, validator outcome.
pub fn format_fit(pf: &PrefixFit) -> String {
    let fit = &pf.fit;
    let mut out = String::new();
    let mark = if fit.accepted { "*" } else { " " };
    let status = match (fit.accepted, fit.bad_fit) {
        (true, _) => "accepted",
        (false, true) => "BAD FIT",
        (false, false) => "rejected",
    };
    let at = if pf.prefix.is_empty() {
        String::new()
    } else {
        format!(" at {:?}", pf.prefix)
    };
    out.push_str(&format!(
        "{mark} {:<12} {:<11}{at} {status} chi2_red={:.3} n={}\n",
        truncate(&fit.model, 12),
        fit.function,
        fit.residual,
        fit.npoints
    ));
    for (name, value) in &fit.params {
        match fit.errors.get(name) {
            Some(err) => out.push_str(&format!("    {name:<10} = {value:>12.6} ± {err:.6}\n")),
            None => out.push_str(&format!("    {name:<10} = {value:>12.6}\n")),
        }
    }
    if !fit.attempted_validators.is_empty() {
        out.push_str(&format!("    validators: {}\n", fit.attempted_validators.join(", ")));
    }
    for failure in &fit.validation_failures {
        out.push_str(&format!("    failed: {failure}\n"));
    }
    out
}

/// Format the above/below-fit tables.
pub fn format_outliers(outliers: &Outliers) -> String {
    let mut out = String::new();
    out.push_str("Furthest above fit:\n");
    out.push_str(&format_table(&outliers.above));
    out.push('\n');
    out.push_str("Furthest below fit:\n");
    out.push_str(&format_table(&outliers.below));
    out
}

fn format_table(rows: &[PointResidual]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:>6} {:>10} {:>12} {:>12} {:>12} {:>8}",
            "index", "x", "mean", "fit", "residual", "pull"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<6} {:-<10} {:-<12} {:-<12} {:-<12} {:-<8}", "", "", "", "", "", "").trim_end());
    out.push('\n');

    for r in rows {
        let pull = r.pull.map(|p| format!("{p:.2}")).unwrap_or_else(|| "-".to_string());
        out.push_str(
            format!(
                "{:>6} {:>10.4} {:>12.4} {:>12.4} {:>12.4} {:>8}",
                r.index, r.x, r.mean, r.fitted, r.residual, pull
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

fn describe_space(space: &PointSpace) -> String {
    match space {
        PointSpace::Flat { values } => {
            let (lo, hi) = values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            format!("sweep of {} points in [{lo:.4}, {hi:.4}]", values.len())
        }
        PointSpace::Grid { axes } => {
            let dims: Vec<String> = axes.iter().map(|a| a.len().to_string()).collect();
            let n: usize = axes.iter().map(Vec::len).product();
            format!("grid {} ({n} points)", dims.join("x"))
        }
        PointSpace::Continuous { start, step } => format!("continuous from {start} step {step}"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
