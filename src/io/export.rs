//! Export per-point results to CSV.
//!
//! One row per (channel, point index), easy to consume in spreadsheets or
//! downstream scripts. Cells with no data are written as empty fields.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::ScanResult;
use crate::fit::FitFunction;
use crate::io::results::ResultsFile;

pub const CSV_HEADER: &str = "channel,index,x,mean,sem,count,fit";

/// Write every channel of `results` to a CSV file.
pub fn write_results_csv(path: &Path, results: &ResultsFile) -> ScanResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    write_results(&mut out, results)?;
    out.flush()?;
    Ok(())
}

/// Write the CSV body to any writer.
pub fn write_results<W: Write>(out: &mut W, results: &ResultsFile) -> ScanResult<()> {
    writeln!(out, "{CSV_HEADER}")?;
    for ch in &results.channels {
        for (i, mean) in ch.means.iter().enumerate() {
            let x = ch.xs.get(i).copied().flatten();
            let sem = ch.sems.get(i).copied().flatten();
            let count = ch.counts.get(i).copied().unwrap_or(0);
            let fitted = match (&ch.fit, x) {
                (Some(fit), Some(x)) if fit.accepted => FitFunction::eval_fit(fit, x),
                _ => None,
            };
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                ch.channel,
                i,
                fmt_opt(x),
                fmt_opt(*mean),
                fmt_opt(sem),
                count,
                fmt_opt(fitted),
            )?;
        }
    }
    Ok(())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.10}")).unwrap_or_default()
}
