//! Terminal plots of scan results.

pub mod ascii;

pub use ascii::*;

use crate::error::{ScanError, ScanResult};
use crate::io::results::ResultsFile;

/// Plot one channel of a results file; the first channel when `channel` is `None`.
pub fn render_results_plot(
    results: &ResultsFile,
    channel: Option<&str>,
    width: usize,
    height: usize,
) -> ScanResult<String> {
    let ch = match channel {
        Some(name) => results
            .channel(name)
            .ok_or_else(|| ScanError::UnknownChannel(name.to_string()))?,
        None => results
            .channels
            .first()
            .ok_or_else(|| ScanError::config("results file has no channels"))?,
    };
    Ok(render_channel_plot(ch, width, height))
}
