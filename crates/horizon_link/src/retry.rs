//! Reconnect pacing for the broker transports.
//!
//! A [`RetryPolicy`] comes from the `[link.transport.retry]` settings. Each
//! supervisor turns it into a [`ReconnectSchedule`] that counts session
//! attempts and hands out the delay before the next one. Establishing a
//! session resets both the count and the delay.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Shortest delay between two session attempts.
const MIN_DELAY: Duration = Duration::from_millis(10);

/// How a broker transport paces reconnects after losing its session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failed session attempts before the transport gives up.
    /// Absent or `0` keeps trying forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Jitter between 0.0 and 1.0; nodes restarted together spread out their reconnects.
    #[serde(default = "RetryPolicy::default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,

    /// Gives up once this much time passed without a session, if set.
    #[serde(default)]
    pub max_elapsed_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
            randomization_factor: Self::default_randomization_factor(),
            multiplier: Self::default_multiplier(),
            max_elapsed_time_ms: None,
        }
    }
}

impl RetryPolicy {
    fn default_initial_interval_ms() -> u64 {
        500
    }

    fn default_max_interval_ms() -> u64 {
        30_000
    }

    fn default_randomization_factor() -> f64 {
        0.2
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    /// Whether a further attempt is allowed after `attempt` failed ones.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            None | Some(0) => true,
            Some(max) => attempt < max,
        }
    }

    fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms).max(MIN_DELAY)
    }

    fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms).max(self.initial_interval())
    }
}

/// Attempt counter and delay sequence of one supervisor.
pub struct ReconnectSchedule {
    policy: RetryPolicy,
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl fmt::Debug for ReconnectSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSchedule")
            .field("policy", &self.policy)
            .field("attempts", &self.attempts)
            .field("current_interval", &self.backoff.current_interval)
            .finish()
    }
}

impl ReconnectSchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: policy.initial_interval(),
            current_interval: policy.initial_interval(),
            max_interval: policy.max_interval(),
            randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
            multiplier: policy.multiplier.max(1.0),
            max_elapsed_time: policy.max_elapsed_time_ms.map(Duration::from_millis),
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        Self {
            policy,
            backoff,
            attempts: 0,
        }
    }

    /// Counts a new session attempt and returns its number, or `None` when the
    /// policy allows no more.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if !self.policy.allows_attempt(self.attempts) {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// A session came up: the next failure starts over from the first delay.
    pub fn connected(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Delay before the next attempt, or `None` once either limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.allows_attempt(self.attempts) {
            return None;
        }
        self.backoff.next_backoff()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
