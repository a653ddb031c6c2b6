use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_auto_reconnect() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

/// Backoff policy for involuntary disconnects of remote transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Attempts per outage. `0` means unbounded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            auto_reconnect: false,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): base doubled per
    /// prior attempt, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.max(1);
        let cap = self.max_delay_ms.max(base);
        let shift = attempt.saturating_sub(1).min(32);
        let delay = base.saturating_mul(1_u64 << shift).min(cap);
        Duration::from_millis(delay)
    }

    /// Whether attempt number `attempt` (1-based) may run.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.auto_reconnect && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }
}
