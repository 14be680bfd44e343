//! Rate limiting for reacquisition actions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::recovery::{Reacquire, Reacquisition};

/// Wraps a reacquire action and reports `Blocked` once `max_attempts`
/// attempts have been made within the sliding `window`.
#[derive(Debug)]
pub struct RateLimitedReacquire<R> {
    inner: R,
    max_attempts: usize,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl<R: Reacquire> RateLimitedReacquire<R> {
    pub fn new(inner: R, max_attempts: usize, window: Duration) -> Self {
        Self {
            inner,
            max_attempts,
            window,
            attempts: VecDeque::with_capacity(max_attempts),
        }
    }

    /// Attempts still counted against the limit.
    pub fn recent_attempts(&self) -> usize {
        self.attempts.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&t) = self.attempts.front() {
            if now.duration_since(t) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl<R: Reacquire> Reacquire for RateLimitedReacquire<R> {
    fn reacquire(&mut self) -> anyhow::Result<Reacquisition> {
        let now = Instant::now();
        self.expire(now);
        if self.attempts.len() >= self.max_attempts {
            warn!(
                attempts = self.attempts.len(),
                window_ms = self.window.as_millis() as u64,
                "reacquisition rate limit reached"
            );
            return Ok(Reacquisition::Blocked {
                reason: format!(
                    "{} reacquisitions within {:?}",
                    self.attempts.len(),
                    self.window
                ),
            });
        }
        self.attempts.push_back(now);
        self.inner.reacquire()
    }
}
