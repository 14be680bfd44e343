//! Model registration records.
//!
//! A model binds a name to one channel and opts into any of:
//! - aggregation of that channel's measurements
//! - plot mutation after each completed point
//! - fitting (when it carries a [`FitSpec`])
//! - calculation from an inner-axis model's fits (when it carries a [`Calculation`])

use serde::{Deserialize, Serialize};

use crate::fit::FitSpec;

/// Derives one value per outer point from an inner-axis model's fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calculation {
    /// Name of the model whose fits are read.
    pub source: String,
    /// Field to read; `None` means the source's main fit.
    #[serde(default)]
    pub param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub channel: String,
    #[serde(default)]
    pub aggregates: bool,
    #[serde(default)]
    pub mutates_plot: bool,
    /// Axis the model's series runs along (0 = outermost).
    #[serde(default)]
    pub dimension: usize,
    #[serde(default)]
    pub fit: Option<FitSpec>,
    #[serde(default)]
    pub calculation: Option<Calculation>,
}

impl ModelEntry {
    /// A model that aggregates and plots a measured channel.
    pub fn measurement(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            aggregates: true,
            mutates_plot: true,
            dimension: 0,
            fit: None,
            calculation: None,
        }
    }

    /// A model whose values come from another model's fits.
    pub fn calculated(name: impl Into<String>, channel: impl Into<String>, calculation: Calculation) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            aggregates: false,
            mutates_plot: true,
            dimension: 0,
            fit: None,
            calculation: Some(calculation),
        }
    }

    pub fn with_fit(mut self, spec: FitSpec) -> Self {
        self.fit = Some(spec);
        self
    }

    pub fn at_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn without_plot(mut self) -> Self {
        self.mutates_plot = false;
        self
    }

    pub fn fits(&self) -> bool {
        self.fit.is_some()
    }

    pub fn calculates(&self) -> bool {
        self.calculation.is_some()
    }
}
