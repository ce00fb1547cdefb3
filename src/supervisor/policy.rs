//! Reconnect and pairing policy.
//!
//! Pure configuration plus the backoff math. The actor asks `allows()` before
//! scheduling a retry and `delay()` for how long to wait.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of automatic reconnects before a chip settles into `error`.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Default QR validity window.
pub const DEFAULT_QR_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of expired QR codes replaced before giving up.
pub const DEFAULT_MAX_QR_REFRESHES: u32 = 5;

/// Exponential backoff with symmetric jitter, bounded by an attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay applied as random spread, 0.0 to 1.0
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Whether the 1-based `attempt` may still be scheduled.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Un-jittered delay: `min(max, base * 2^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the 1-based `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let spread = rand::rng().random_range(-jitter..=jitter);
        capped.mul_f64(1.0 + spread)
    }
}

/// Knobs of the per-chip state machine.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub qr_timeout: Duration,
    pub max_qr_refreshes: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on a clean logout during `disconnect()`
    pub logout_timeout: Duration,
    /// Root under which each chip's credentials live
    pub credentials_dir: PathBuf,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            qr_timeout: DEFAULT_QR_TIMEOUT,
            max_qr_refreshes: DEFAULT_MAX_QR_REFRESHES,
            backoff: BackoffPolicy::default(),
            logout_timeout: Duration::from_secs(5),
            credentials_dir: PathBuf::from("credentials"),
        }
    }
}
