//! Read/write results JSON files.
//!
//! A results file is the portable record of one run: the space and settings
//! it ran with, where the traversal stopped, and the means/SEMs/fits of every
//! measured and calculated channel. `scan plot` renders straight from it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelResults, IterationState, RunOutcome, ScanSettings, ScanState};
use crate::error::ScanResult;
use crate::scan::Scan;
use crate::space::PointSpace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsFile {
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub state: ScanState,
    pub space: PointSpace,
    pub settings: ScanSettings,
    pub iteration: IterationState,
    /// Measured channels first, then calculated ones.
    pub channels: Vec<ChannelResults>,
    #[serde(default)]
    pub datasets: BTreeMap<String, f64>,
}

impl ResultsFile {
    /// Snapshot a scan after `run` returned `outcome`.
    pub fn from_scan(scan: &Scan, outcome: RunOutcome) -> ScanResult<Self> {
        let registry = scan.registry();
        let channels = registry
            .channels_for_measurement()
            .chain(registry.calculated_channels())
            .map(|c| scan.get_results(c))
            .collect::<ScanResult<Vec<_>>>()?;

        Ok(Self {
            tool: "scan".to_string(),
            created_at: Utc::now(),
            outcome,
            state: scan.state(),
            space: scan.space().clone(),
            settings: scan.settings().clone(),
            iteration: *scan.iteration(),
            channels,
            datasets: scan.datasets().clone(),
        })
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelResults> {
        self.channels.iter().find(|c| c.channel == name)
    }
}

pub fn write_results_json(path: &Path, results: &ResultsFile) -> ScanResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), results)?;
    Ok(())
}

pub fn read_results_json(path: &Path) -> ScanResult<ResultsFile> {
    let file = File::open(path)?;
    let results = serde_json::from_reader(BufReader::new(file))?;
    Ok(results)
}
