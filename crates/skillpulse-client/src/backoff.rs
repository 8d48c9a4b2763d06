use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_GROWTH: f64 = 1.5;
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub growth: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            growth: DEFAULT_BACKOFF_GROWTH,
            cap: DEFAULT_BACKOFF_CAP,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): `min(base * growth^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.growth.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Consecutive-failure counter on top of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Next retry delay, or `None` once `max_attempts` retries were handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
