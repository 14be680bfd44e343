//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and installs logging
//! - parses CLI arguments
//! - runs the scan and prints reports/plots
//! - writes optional exports

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, PlotArgs, RunArgs};
use crate::error::ScanResult;

pub mod pipeline;

/// Entry point for the `scan` binary.
pub fn run() -> ScanResult<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Plot(args) => handle_plot(args),
    }
}

/// Log to stderr at `warn` unless `RUST_LOG` says otherwise.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed (e.g. by an embedding test harness).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_run(args: RunArgs) -> ScanResult<()> {
    let file = crate::io::config::read_scan_file(&args.config)?;
    info!(config = %args.config.display(), seed = args.seed, "running scan");

    let opts = pipeline::RunOptions {
        seed: args.seed,
        max_points: args.max_points,
        max_resumes: args.max_resumes,
    };
    let run = pipeline::run_scan(&file, &opts)?;

    println!("{}", crate::report::format_run_summary(&run.results));

    for ch in &run.results.channels {
        let residuals = crate::report::compute_residuals(ch)?;
        if !residuals.is_empty() {
            println!("Channel {} residuals:", ch.channel);
            println!(
                "{}",
                crate::report::format_outliers(&crate::report::rank_outliers(&residuals, args.top))
            );
        }
        if args.plot {
            println!("{}", crate::plot::render_channel_plot(ch, args.width, args.height));
        }
    }

    if let Some(path) = &args.export_csv {
        crate::io::export::write_results_csv(path, &run.results)?;
        info!(path = %path.display(), "wrote CSV");
    }
    if let Some(path) = &args.export_results {
        crate::io::results::write_results_json(path, &run.results)?;
        info!(path = %path.display(), "wrote results JSON");
    }

    // A fit rejected by a strict validator fails the run.
    if let Some(err) = run
        .results
        .channels
        .iter()
        .flat_map(|c| &c.fits)
        .find_map(|pf| pf.fit.bad_fit_error())
    {
        return Err(err);
    }
    Ok(())
}

fn handle_plot(args: PlotArgs) -> ScanResult<()> {
    let results = crate::io::results::read_results_json(&args.results)?;
    let plot = crate::plot::render_results_plot(&results, args.channel.as_deref(), args.width, args.height)?;
    println!("{plot}");
    Ok(())
}
