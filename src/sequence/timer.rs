//! Pausable countdown used by SLEEP schedule entries.
//!
//! The timer keeps a remaining-time budget rather than a fixed deadline, so a
//! pause/resume cycle continues with `remaining = budget - elapsed` instead of
//! restarting the full interval. The subtraction saturates at zero: scheduling
//! jitter can make the measured elapsed time exceed the budget, and a resumed
//! timer must then fire immediately, never wait a bogus wrapped interval.
//!
//! Built on [`tokio::time::Instant`] so tests can drive it with the paused
//! test clock.

use std::time::Duration;
use tokio::time::Instant;

/// Countdown with pause/resume and remaining-time accounting.
#[derive(Debug)]
pub struct SleepTimer {
    remaining: Duration,
    running_since: Option<Instant>,
}

impl SleepTimer {
    /// Create a stopped timer with the full budget remaining.
    pub fn new(total: Duration) -> Self {
        Self {
            remaining: total,
            running_since: None,
        }
    }

    /// Start (or resume) the countdown.
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Stop the countdown, banking the time spent running.
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.remaining = self.remaining.saturating_sub(since.elapsed());
        }
    }

    /// Alias for [`SleepTimer::start`] on a paused timer.
    pub fn resume(&mut self) {
        self.start();
    }

    /// Whether the countdown is currently running.
    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Time left on the budget as of now. Zero once expired.
    pub fn remaining(&self) -> Duration {
        match self.running_since {
            Some(since) => self.remaining.saturating_sub(since.elapsed()),
            None => self.remaining,
        }
    }
}
