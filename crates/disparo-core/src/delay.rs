use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DELAY_SECONDS: f64 = 3.0;
pub const MAX_DELAY_SECONDS: f64 = 300.0;
pub const MAX_VARIATION_SECONDS: f64 = 3.0;
pub const ERROR_PENALTY_SECONDS: f64 = 2.0;
pub const MIN_EFFECTIVE_BASE_SECONDS: f64 = 1.0;
pub const ERROR_STREAK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("delaySeconds must be between 0 and {max}, got {value}")]
pub struct DelayConfigError {
    pub value: f64,
    pub max: f64,
}

impl DelayConfigError {
    pub fn code(&self) -> &'static str {
        "INVALID_DELAY"
    }
}

/// Pacing parameters shared by every batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(rename = "delaySeconds")]
    pub base_seconds: f64,
    #[serde(rename = "variation")]
    pub variation_seconds: f64,
    #[serde(rename = "errorPenalty")]
    pub error_penalty_seconds: f64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self::from_base(DEFAULT_DELAY_SECONDS)
    }
}

impl DelayConfig {
    /// Build a config from a base delay, clamping it into `[0, 300]`.
    pub fn from_base(base_seconds: f64) -> Self {
        let base = if base_seconds.is_nan() {
            DEFAULT_DELAY_SECONDS
        } else {
            base_seconds.clamp(0.0, MAX_DELAY_SECONDS)
        };
        Self {
            base_seconds: base,
            variation_seconds: (base * 0.5).min(MAX_VARIATION_SECONDS),
            error_penalty_seconds: ERROR_PENALTY_SECONDS,
        }
    }

    /// Like [`DelayConfig::from_base`] but rejects out-of-range input instead of clamping.
    pub fn validated(base_seconds: f64) -> Result<Self, DelayConfigError> {
        if !base_seconds.is_finite() || !(0.0..=MAX_DELAY_SECONDS).contains(&base_seconds) {
            return Err(DelayConfigError {
                value: base_seconds,
                max: MAX_DELAY_SECONDS,
            });
        }
        Ok(Self::from_base(base_seconds))
    }

    pub fn description(&self) -> String {
        format!(
            "{}s base, ±{}s variation, +{}s per error",
            self.base_seconds, self.variation_seconds, self.error_penalty_seconds
        )
    }

    fn effective_base(&self) -> f64 {
        self.base_seconds.max(MIN_EFFECTIVE_BASE_SECONDS)
    }

    fn penalty_for(&self, consecutive_errors: u32) -> f64 {
        if consecutive_errors >= ERROR_STREAK_THRESHOLD {
            self.error_penalty_seconds
        } else {
            0.0
        }
    }

    /// Inclusive `(min, max)` bounds of [`compute_delay_millis`] for an error streak.
    pub fn bounds_millis(&self, consecutive_errors: u32) -> (f64, f64) {
        let base = self.effective_base();
        let penalty = self.penalty_for(consecutive_errors);
        (
            (base - self.variation_seconds + penalty) * 1000.0,
            (base + self.variation_seconds + penalty) * 1000.0,
        )
    }
}

/// `(max(1, base) + jitter + penalty) * 1000`, jitter uniform in `±variation`,
/// penalty only once the error streak reaches three.
pub fn compute_delay_millis<R: Rng + ?Sized>(
    config: &DelayConfig,
    consecutive_errors: u32,
    rng: &mut R,
) -> f64 {
    let variation = config.variation_seconds;
    let jitter = if variation > 0.0 {
        rng.gen_range(-variation..=variation)
    } else {
        0.0
    };
    (config.effective_base() + jitter + config.penalty_for(consecutive_errors)) * 1000.0
}

pub fn compute_delay<R: Rng + ?Sized>(
    config: &DelayConfig,
    consecutive_errors: u32,
    rng: &mut R,
) -> Duration {
    let millis = compute_delay_millis(config, consecutive_errors, rng).max(0.0);
    Duration::from_secs_f64(millis / 1000.0)
}
