//! Exponential-backoff policy for streaming-channel reconnection.
//!
//! When the channel to a backend drops, the connection task retries
//! with increasing delays until either a connect succeeds or
//! [`ReconnectConfig::max_attempts`] is exhausted. Delays are jittered
//! so that a fleet of clients does not reconnect in lock-step.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Jitter amplitude: the nominal delay is scaled by `1 ± jitter·rand`.
    pub jitter: f64,
    /// Give up after this many failed attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 10,
        }
    }
}

/// Un-jittered delay for attempt `n` (1-based).
///
/// `base · multiplier^(n−1)`, clamped to `[base_delay, max_delay]`.
pub fn nominal_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let ms = config.base_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    let clamped = ms
        .max(config.base_delay.as_millis() as f64)
        .min(config.max_delay.as_millis() as f64);
    Duration::from_millis(clamped as u64)
}

/// Jittered delay for attempt `n` (1-based).
pub fn next_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let nominal = nominal_delay(attempt, config).as_millis() as f64;
    let factor = rand::rng().random_range((1.0 - config.jitter)..=(1.0 + config.jitter));
    Duration::from_millis((nominal * factor) as u64)
}
