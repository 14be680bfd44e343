//! Simulated measurement for dry runs and tests.
//!
//! Each channel follows one of the built-in fit functions of the innermost
//! coordinate plus seeded Gaussian noise. An optional per-call loss
//! probability models a resource dropping out: once lost, every channel
//! reads the background level until the resource is reloaded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::Point;
use crate::error::{ScanError, ScanResult};
use crate::fit::FitFunction;
use crate::recovery::{Reacquire, Reacquisition};
use crate::scan::Measurement;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub channel: String,
    pub function: FitFunction,
    /// Full parameter vector in `FitFunction::param_names` order.
    pub params: Vec<f64>,
    /// Standard deviation of the additive noise.
    #[serde(default)]
    pub noise: f64,
    /// Per-parameter change per unit of the outermost coordinate.
    #[serde(default)]
    pub drift: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub signals: Vec<SignalConfig>,
    /// Chance per measurement that the resource is lost.
    #[serde(default)]
    pub loss_probability: f64,
    /// Level every channel reads while the resource is lost.
    #[serde(default)]
    pub background: f64,
}

impl SimulationConfig {
    pub fn validate(&self) -> ScanResult<()> {
        if !(0.0..1.0).contains(&self.loss_probability) {
            return Err(ScanError::config("loss_probability must be in [0, 1)"));
        }
        if !self.background.is_finite() {
            return Err(ScanError::config("background must be finite"));
        }
        for s in &self.signals {
            let count = s.function.param_count();
            if s.params.len() != count {
                return Err(ScanError::config(format!(
                    "signal '{}': {} takes {count} parameters, got {}",
                    s.channel,
                    s.function.name(),
                    s.params.len()
                )));
            }
            if !s.drift.is_empty() && s.drift.len() != count {
                return Err(ScanError::config(format!(
                    "signal '{}': drift must be empty or have {count} entries",
                    s.channel
                )));
            }
            if !(s.noise.is_finite() && s.noise >= 0.0) {
                return Err(ScanError::config(format!(
                    "signal '{}': noise must be a finite non-negative number",
                    s.channel
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimulatedMeasurement {
    signals: HashMap<String, SignalConfig>,
    rng: StdRng,
    normal: Normal<f64>,
    loss_probability: f64,
    background: f64,
    lost: Arc<AtomicBool>,
    warmups: usize,
}

impl SimulatedMeasurement {
    pub fn new(config: &SimulationConfig, seed: u64) -> ScanResult<Self> {
        config.validate()?;
        let normal =
            Normal::new(0.0, 1.0).map_err(|e| ScanError::config(format!("noise distribution error: {e}")))?;
        Ok(Self {
            signals: config
                .signals
                .iter()
                .map(|s| (s.channel.clone(), s.clone()))
                .collect(),
            rng: StdRng::seed_from_u64(seed),
            normal,
            loss_probability: config.loss_probability,
            background: config.background,
            lost: Arc::new(AtomicBool::new(false)),
            warmups: 0,
        })
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Reacquire action that restores this measurement's resource.
    pub fn reload(&self) -> SimulatedReload {
        SimulatedReload {
            lost: Arc::clone(&self.lost),
            reloads: 0,
        }
    }

    pub fn warmups(&self) -> usize {
        self.warmups
    }

    fn clean_value(signal: &SignalConfig, point: &Point) -> f64 {
        let x = point.innermost();
        if signal.drift.is_empty() || point.ndim() < 2 {
            return signal.function.eval(x, &signal.params);
        }
        let outer = point.coord(0).unwrap_or(0.0);
        let params: Vec<f64> = signal
            .params
            .iter()
            .zip(&signal.drift)
            .map(|(p, d)| p + d * outer)
            .collect();
        signal.function.eval(x, &params)
    }
}

impl Measurement for SimulatedMeasurement {
    fn measure(&mut self, point: &Point, channel: &str) -> anyhow::Result<f64> {
        let signal = self
            .signals
            .get(channel)
            .ok_or_else(|| anyhow::anyhow!("no simulated signal for channel '{channel}'"))?;

        if self.loss_probability > 0.0 && !self.is_lost() && self.rng.gen_bool(self.loss_probability) {
            debug!(%point, channel, "simulated resource lost");
            self.lost.store(true, Ordering::SeqCst);
        }
        let clean = if self.is_lost() {
            self.background
        } else {
            Self::clean_value(signal, point)
        };
        Ok(clean + signal.noise * self.normal.sample(&mut self.rng))
    }

    fn warmup(&mut self, _point: &Point, _channel: &str) -> anyhow::Result<()> {
        self.warmups += 1;
        Ok(())
    }
}

/// Clears the shared loss flag of a [`SimulatedMeasurement`].
#[derive(Debug)]
pub struct SimulatedReload {
    lost: Arc<AtomicBool>,
    reloads: usize,
}

impl SimulatedReload {
    pub fn reloads(&self) -> usize {
        self.reloads
    }
}

impl Reacquire for SimulatedReload {
    fn reacquire(&mut self) -> anyhow::Result<Reacquisition> {
        self.reloads += 1;
        self.lost.store(false, Ordering::SeqCst);
        info!(reloads = self.reloads, "simulated resource reloaded");
        Ok(Reacquisition::Acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(noise: f64) -> SimulationConfig {
        SimulationConfig {
            signals: vec![SignalConfig {
                channel: "pmt".into(),
                function: FitFunction::Line,
                params: vec![1.0, 2.0],
                noise,
                drift: Vec::new(),
            }],
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn noiseless_signal_follows_function() {
        let mut sim = SimulatedMeasurement::new(&line(0.0), 7).unwrap();
        let v = sim.measure(&Point::Scalar(3.0), "pmt").unwrap();
        assert_eq!(v, 7.0);
    }

    #[test]
    fn same_seed_same_samples() {
        let mut a = SimulatedMeasurement::new(&line(0.5), 11).unwrap();
        let mut b = SimulatedMeasurement::new(&line(0.5), 11).unwrap();
        for i in 0..10 {
            let p = Point::Scalar(i as f64);
            assert_eq!(a.measure(&p, "pmt").unwrap(), b.measure(&p, "pmt").unwrap());
        }
    }

    #[test]
    fn drift_moves_parameters_along_outer_axis() {
        let mut config = line(0.0);
        config.signals[0].drift = vec![0.0, 1.0];
        let mut sim = SimulatedMeasurement::new(&config, 1).unwrap();
        // slope = 2 + 1 * outer
        let v = sim.measure(&Point::Tuple(vec![2.0, 1.0]), "pmt").unwrap();
        assert_eq!(v, 5.0);
    }

    #[test]
    fn lost_resource_reads_background_until_reloaded() {
        let mut config = line(0.0);
        config.loss_probability = 0.999_999;
        config.background = -1.0;
        let mut sim = SimulatedMeasurement::new(&config, 3).unwrap();
        let mut reload = sim.reload();

        assert_eq!(sim.measure(&Point::Scalar(0.0), "pmt").unwrap(), -1.0);
        assert!(sim.is_lost());
        assert_eq!(reload.reacquire().unwrap(), Reacquisition::Acquired);
        assert!(!sim.is_lost());
        assert_eq!(reload.reloads(), 1);
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let mut sim = SimulatedMeasurement::new(&line(0.0), 1).unwrap();
        assert!(sim.measure(&Point::Scalar(0.0), "apd").is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = line(0.0);
        config.signals[0].params.push(1.0);
        assert!(config.validate().is_err());

        let mut config = line(0.0);
        config.loss_probability = 1.0;
        assert!(config.validate().is_err());
    }
}
