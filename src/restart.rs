use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Decision returned by the restart policy after a capture process crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after `delay` (includes 1-based attempt number within the window).
    Restart { attempt: u32, delay: Duration },
    /// Too many crashes inside the window. Terminal.
    GiveUp { crashes: u32 },
}

/// Sliding-window restart budget with exponential backoff.
///
/// At most `max_restarts` crashes are answered with a restart inside any
/// window of `window` length. The crash after that gives up.
pub struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    crashes: VecDeque<Instant>,
    total_restarts: u32,
}

impl RestartPolicy {
    pub fn new(
        max_restarts: u32,
        window: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            max_restarts,
            window,
            initial_backoff,
            max_backoff,
            crashes: VecDeque::new(),
            total_restarts: 0,
        }
    }

    /// Record a crash at `now` and decide what to do next.
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        self.expire(now);
        self.crashes.push_back(now);
        let attempt = self.crashes.len() as u32;

        if attempt <= self.max_restarts {
            let delay = backoff_delay(self.initial_backoff, attempt - 1, self.max_backoff);
            self.total_restarts += 1;
            warn!(
                attempt,
                max_restarts = self.max_restarts,
                delay_ms = delay.as_millis() as u64,
                "capture process crashed, restarting"
            );
            RestartDecision::Restart { attempt, delay }
        } else {
            warn!(
                crashes = attempt,
                window_secs = self.window.as_secs(),
                "restart budget exhausted, giving up"
            );
            RestartDecision::GiveUp { crashes: attempt }
        }
    }

    /// Drop crashes that fell out of the sliding window.
    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.crashes.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Crashes currently inside the window.
    #[cfg(test)]
    fn recent_crashes(&mut self, now: Instant) -> u32 {
        self.expire(now);
        self.crashes.len() as u32
    }

    /// Restarts granted over the whole session.
    pub fn total_restarts(&self) -> u32 {
        self.total_restarts
    }
}

/// Calculate exponential backoff delay.
///
/// Returns `initial * 2^consecutive`, capped at `max`.
pub fn backoff_delay(initial: Duration, consecutive: u32, max: Duration) -> Duration {
    let shift = 1u32.checked_shl(consecutive).unwrap_or(u32::MAX);
    initial.saturating_mul(shift).min(max)
}
