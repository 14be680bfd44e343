//! Ordered model registry.
//!
//! Registration order is significant: measurement channels are read in the
//! order their first aggregating model was registered, and models of one
//! dimension are fitted in registration order.

use std::collections::HashSet;

use crate::error::{ScanError, ScanResult};
use crate::fit::MainFit;
use crate::models::{Calculation, ModelEntry};

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: ModelEntry) -> ScanResult<()> {
        if entry.name.is_empty() || entry.channel.is_empty() {
            return Err(ScanError::config("model name and channel must be non-empty"));
        }
        if self.get(&entry.name).is_some() {
            return Err(ScanError::DuplicateRegistration(format!(
                "model '{}' is already registered",
                entry.name
            )));
        }
        if let Some(other) = self.entries.iter().find(|e| {
            e.channel == entry.channel
                && e.dimension == entry.dimension
                && (e.fits() != entry.fits() || e.aggregates != entry.aggregates)
        }) {
            return Err(ScanError::DuplicateRegistration(format!(
                "channel '{}' at dimension {} is already bound by '{}' with different fits/aggregates flags",
                entry.channel, entry.dimension, other.name
            )));
        }

        match (&entry.calculation, entry.aggregates) {
            (None, false) => {
                return Err(ScanError::config(format!(
                    "model '{}' neither aggregates nor calculates",
                    entry.name
                )));
            }
            (Some(_), true) => {
                return Err(ScanError::config(format!(
                    "calculated model '{}' cannot aggregate measurements",
                    entry.name
                )));
            }
            _ => {}
        }

        if let Some(spec) = &entry.fit {
            spec.check_names()?;
        }
        if let Some(calc) = &entry.calculation {
            self.check_calculation(&entry, calc)?;
        }

        self.entries.push(entry);
        Ok(())
    }

    fn check_calculation(&self, entry: &ModelEntry, calc: &Calculation) -> ScanResult<()> {
        let source = self
            .get(&calc.source)
            .ok_or_else(|| ScanError::UnknownModel(calc.source.clone()))?;
        let Some(spec) = &source.fit else {
            return Err(ScanError::config(format!(
                "'{}' calculates from '{}', which does not fit",
                entry.name, source.name
            )));
        };
        if source.dimension != entry.dimension + 1 {
            return Err(ScanError::config(format!(
                "'{}' at dimension {} must read a model at dimension {}, '{}' is at {}",
                entry.name,
                entry.dimension,
                entry.dimension + 1,
                source.name,
                source.dimension
            )));
        }
        let field = match (&calc.param, &spec.main_fit) {
            (Some(param), _) => param.clone(),
            (None, Some(main)) => main.param().to_string(),
            (None, None) => {
                return Err(ScanError::config(format!(
                    "'{}' names no parameter and '{}' has no main fit",
                    entry.name, source.name
                )));
            }
        };
        // Probe the field on a spec that declares it as its main fit.
        spec.clone()
            .with_main_fit(MainFit::Param(field))
            .check_names()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct aggregating channels, in registration order.
    pub fn channels_for_measurement(&self) -> impl Iterator<Item = &str> + '_ {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| e.aggregates)
            .map(|e| e.channel.as_str())
            .filter(move |c| seen.insert(*c))
    }

    pub fn entries_for(&self, dimension: usize) -> impl Iterator<Item = &ModelEntry> + '_ {
        self.entries.iter().filter(move |e| e.dimension == dimension)
    }

    /// Check dimensions against a space with `ndim` axes.
    ///
    /// Aggregating models run along the innermost axis; outer axes are
    /// reached only through calculations.
    pub fn check_topology(&self, ndim: usize) -> ScanResult<()> {
        for e in &self.entries {
            if e.dimension >= ndim {
                return Err(ScanError::config(format!(
                    "model '{}' is at dimension {} but the scan has {ndim} axes",
                    e.name, e.dimension
                )));
            }
            if e.aggregates && e.dimension != ndim - 1 {
                return Err(ScanError::config(format!(
                    "aggregating model '{}' must be at the innermost dimension {}",
                    e.name,
                    ndim - 1
                )));
            }
        }
        Ok(())
    }

    /// Channels of calculated models, in registration order.
    pub fn calculated_channels(&self) -> impl Iterator<Item = &str> + '_ {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| e.calculates())
            .map(|e| e.channel.as_str())
            .filter(move |c| seen.insert(*c))
    }
}
