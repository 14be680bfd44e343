//! Command-line parsing for the `scan` binary.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! scan engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "scan", version, about = "Parameterized sweep scans with repeat statistics and fitting")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a scan definition against the simulated measurement and report the results.
    Run(RunArgs),
    /// Plot a channel of a previously exported results JSON.
    Plot(PlotArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct RunArgs {
    /// Scan definition (JSON).
    #[arg(short = 'c', long, value_name = "JSON")]
    pub config: PathBuf,

    /// Random seed for the simulated measurement.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Stop after this many points. Required for continuous scans.
    #[arg(long)]
    pub max_points: Option<usize>,

    /// Give up after this many resumes of a scan paused by blocked reacquisition.
    #[arg(long, default_value_t = 5)]
    pub max_resumes: usize,

    /// Show the N points furthest above and below each fit.
    #[arg(long, default_value_t = 5)]
    pub top: usize,

    /// Render an ASCII plot per channel.
    #[arg(long)]
    pub plot: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 80)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 20)]
    pub height: usize,

    /// Export per-point means/SEMs to CSV.
    #[arg(long = "export-csv", value_name = "CSV")]
    pub export_csv: Option<PathBuf>,

    /// Export the full results (settings, statistics, fits) to JSON.
    #[arg(long = "export-results", value_name = "JSON")]
    pub export_results: Option<PathBuf>,
}

/// Options for plotting saved results.
#[derive(Debug, Parser)]
pub struct PlotArgs {
    /// Results JSON produced by `scan run --export-results`.
    #[arg(long, value_name = "JSON")]
    pub results: PathBuf,

    /// Channel to plot (defaults to the first one).
    #[arg(long)]
    pub channel: Option<String>,

    /// Plot width (columns).
    #[arg(long, default_value_t = 80)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 20)]
    pub height: usize,
}
