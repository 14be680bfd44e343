//! Lost-resource detection.
//!
//! The hook is consulted after data collection and before the pause check,
//! so a rewind always starts from fully committed statistics.
//!
//! ```text
//! Idle ─check─▶ Checking ─┬─ Continue / ResourcePresent ─▶ Idle
//!                         └─ RequestResource ─▶ RequestingResource
//! RequestingResource ─begin_rewind─▶ Rewinding ─reacquire─┬─ Acquired ─▶ Idle
//!                                                          └─ Blocked ──▶ Blocked
//! Blocked ─reacquire─▶ (Idle | Blocked)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{CheckGranularity, IterationState};
use crate::error::{ScanError, ScanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Checking,
    RequestingResource,
    Rewinding,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySignal {
    /// Nothing to say about the resource.
    Continue,
    /// The resource was positively confirmed.
    ResourcePresent,
    /// The resource is gone; it may have been gone for up to `rewind` points.
    RequestResource { rewind: usize },
}

/// Samples of one channel collected since the last check.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSamples<'a> {
    pub channel: &'a str,
    pub values: &'a [f64],
}

#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub point_index: usize,
    /// Index of the repeat that was just measured, counted over the run.
    pub global_repeat: u64,
    pub iteration: &'a IterationState,
    pub samples: &'a [ChannelSamples<'a>],
}

impl CheckContext<'_> {
    pub fn samples_for(&self, channel: &str) -> Option<&[f64]> {
        self.samples
            .iter()
            .find(|s| s.channel == channel)
            .map(|s| s.values)
    }

    pub fn mean_of(&self, channel: &str) -> Option<f64> {
        let values = self.samples_for(channel)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Decides whether the resource is still present.
pub trait ResourceCheck: Send {
    fn check(&mut self, ctx: &CheckContext<'_>) -> RecoverySignal;
}

impl<F> ResourceCheck for F
where
    F: FnMut(&CheckContext<'_>) -> RecoverySignal + Send,
{
    fn check(&mut self, ctx: &CheckContext<'_>) -> RecoverySignal {
        self(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reacquisition {
    Acquired,
    /// Reacquisition cannot proceed now; an external corrective action must run.
    Blocked { reason: String },
}

/// Action that brings a lost resource back.
pub trait Reacquire: Send {
    fn reacquire(&mut self) -> anyhow::Result<Reacquisition>;
}

impl<F> Reacquire for F
where
    F: FnMut() -> anyhow::Result<Reacquisition> + Send,
{
    fn reacquire(&mut self) -> anyhow::Result<Reacquisition> {
        self()
    }
}

/// Requests the resource when a channel's mean for the checked samples drops
/// below `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub channel: String,
    pub threshold: f64,
    /// Points to rewind when the resource is lost.
    #[serde(default = "default_rewind")]
    pub rewind: usize,
}

fn default_rewind() -> usize {
    1
}

impl ResourceCheck for ThresholdCheck {
    fn check(&mut self, ctx: &CheckContext<'_>) -> RecoverySignal {
        match ctx.mean_of(&self.channel) {
            Some(mean) if mean < self.threshold => RecoverySignal::RequestResource { rewind: self.rewind },
            Some(_) => RecoverySignal::ResourcePresent,
            None => RecoverySignal::Continue,
        }
    }
}

pub struct RecoveryHook {
    check: Box<dyn ResourceCheck>,
    reacquire: Box<dyn Reacquire>,
    granularity: CheckGranularity,
    state: RecoveryState,
}

impl fmt::Debug for RecoveryHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryHook")
            .field("granularity", &self.granularity)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RecoveryHook {
    pub fn new(check: impl ResourceCheck + 'static, reacquire: impl Reacquire + 'static) -> Self {
        Self {
            check: Box::new(check),
            reacquire: Box::new(reacquire),
            granularity: CheckGranularity::default(),
            state: RecoveryState::Idle,
        }
    }

    pub fn with_granularity(mut self, granularity: CheckGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn granularity(&self) -> CheckGranularity {
        self.granularity
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_blocked(&self) -> bool {
        self.state == RecoveryState::Blocked
    }

    pub fn check(&mut self, ctx: &CheckContext<'_>) -> RecoverySignal {
        self.state = RecoveryState::Checking;
        let signal = self.check.check(ctx);
        self.state = match signal {
            RecoverySignal::RequestResource { rewind } => {
                debug!(point = ctx.point_index, repeat = ctx.global_repeat, rewind, "resource lost");
                RecoveryState::RequestingResource
            }
            RecoverySignal::Continue | RecoverySignal::ResourcePresent => RecoveryState::Idle,
        };
        signal
    }

    pub fn begin_rewind(&mut self) {
        self.state = RecoveryState::Rewinding;
    }

    /// Run the reacquisition action.
    ///
    /// An `Err` from the action is escalated as `ResourceBlocked`.
    pub fn reacquire(&mut self) -> ScanResult<Reacquisition> {
        match self.reacquire.reacquire() {
            Ok(Reacquisition::Acquired) => {
                self.state = RecoveryState::Idle;
                Ok(Reacquisition::Acquired)
            }
            Ok(Reacquisition::Blocked { reason }) => {
                warn!(%reason, "resource reacquisition blocked");
                self.state = RecoveryState::Blocked;
                Ok(Reacquisition::Blocked { reason })
            }
            Err(err) => {
                self.state = RecoveryState::Blocked;
                Err(ScanError::ResourceBlocked(format!("{err:#}")))
            }
        }
    }

    /// Return to `Idle` (used when a run is re-initialized).
    pub fn reset(&mut self) {
        self.state = RecoveryState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(state: &'a IterationState, samples: &'a [ChannelSamples<'a>]) -> CheckContext<'a> {
        CheckContext {
            point_index: state.i_point,
            global_repeat: state.i,
            iteration: state,
            samples,
        }
    }

    #[test]
    fn threshold_check_requests_resource_below_threshold() {
        let state = IterationState::new(Some(4), Some(1), 2, 0);
        let mut check = ThresholdCheck {
            channel: "pmt".into(),
            threshold: 10.0,
            rewind: 2,
        };
        let low = [ChannelSamples { channel: "pmt", values: &[3.0, 4.0] }];
        let high = [ChannelSamples { channel: "pmt", values: &[30.0, 40.0] }];
        let other = [ChannelSamples { channel: "aux", values: &[0.0] }];
        assert_eq!(check.check(&ctx(&state, &low)), RecoverySignal::RequestResource { rewind: 2 });
        assert_eq!(check.check(&ctx(&state, &high)), RecoverySignal::ResourcePresent);
        assert_eq!(check.check(&ctx(&state, &other)), RecoverySignal::Continue);
    }

    #[test]
    fn hook_walks_through_states() {
        let state = IterationState::new(Some(4), Some(1), 1, 0);
        let mut blocked_once = true;
        let mut hook = RecoveryHook::new(
            |_: &CheckContext<'_>| RecoverySignal::RequestResource { rewind: 1 },
            move || {
                if std::mem::take(&mut blocked_once) {
                    Ok(Reacquisition::Blocked { reason: "busy".into() })
                } else {
                    Ok(Reacquisition::Acquired)
                }
            },
        );
        assert_eq!(hook.state(), RecoveryState::Idle);
        hook.check(&ctx(&state, &[]));
        assert_eq!(hook.state(), RecoveryState::RequestingResource);
        hook.begin_rewind();
        assert_eq!(hook.state(), RecoveryState::Rewinding);
        assert!(matches!(hook.reacquire().unwrap(), Reacquisition::Blocked { .. }));
        assert!(hook.is_blocked());
        assert_eq!(hook.reacquire().unwrap(), Reacquisition::Acquired);
        assert_eq!(hook.state(), RecoveryState::Idle);
    }

    #[test]
    fn failing_reacquire_escalates() {
        let mut hook = RecoveryHook::new(
            |_: &CheckContext<'_>| RecoverySignal::Continue,
            || -> anyhow::Result<Reacquisition> { Err(anyhow::anyhow!("loader jammed")) },
        );
        let err = hook.reacquire().unwrap_err();
        assert!(matches!(err, ScanError::ResourceBlocked(ref m) if m.contains("jammed")));
        assert!(hook.is_blocked());
    }
}
