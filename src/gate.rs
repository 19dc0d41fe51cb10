//! Time-based throttle for preview refresh and other expensive per-frame work

use std::time::{Duration, Instant};

/// Accepts at most one tick per `period`.
///
/// Frame acquisition is never throttled by the gate; only the work done with
/// an accepted frame (JPEG encoding for the remote preview, undistortion) is.
#[derive(Debug, Clone)]
pub struct SamplingGate {
    period: Duration,
    last_accepted: Option<Instant>,
}

impl SamplingGate {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_accepted: None,
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::new(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Returns true when at least one period has elapsed since the last
    /// accepted tick, and records `now` as the new reference.
    pub fn should_accept(&mut self, now: Instant) -> bool {
        let accept = match self.last_accepted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.period,
        };
        if accept {
            self.last_accepted = Some(now);
        }
        accept
    }

    /// Restart the period at `now` without accepting a tick
    pub fn reset(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
