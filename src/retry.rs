//! Retry policy: backoff delays and attempt limits.
//!
//! Backoff is exponential in the attempt number and capped:
//! `min(base * 2^(attempt - 1), max)`. Symmetric jitter spreads workers that
//! failed together so they do not all come back in the same instant.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff without jitter.
///
/// `attempt` is the failure count including the one just recorded (1-indexed);
/// 0 is treated as 1. Non-decreasing in `attempt`, saturating at `max`.
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Backoff settings applied when a failed task is re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "secs")]
    pub base: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
    /// Symmetric jitter fraction, e.g. 0.1 for ±10%. 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        compute_backoff(attempt, self.base, self.max)
    }

    /// Draw a jitter multiplier in `[1 - jitter, 1 + jitter]`.
    pub fn draw_jitter<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.jitter <= 0.0 {
            1.0
        } else {
            rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        }
    }

    /// Backoff scaled by a pre-drawn jitter multiplier, never above `max`.
    pub fn jittered(&self, attempt: u32, multiplier: f64) -> Duration {
        self.backoff(attempt)
            .mul_f64(multiplier.max(0.0))
            .min(self.max)
    }

    pub fn backoff_with_jitter<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let multiplier = self.draw_jitter(rng);
        self.jittered(attempt, multiplier)
    }
}

/// Resolves `max_attempts` for new tasks: explicit value, then per-type
/// limit, then the global default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLimits {
    pub default_max_attempts: u32,
    #[serde(default)]
    pub per_type: HashMap<String, u32>,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            per_type: HashMap::new(),
        }
    }
}

impl AttemptLimits {
    pub fn new(default_max_attempts: u32) -> Self {
        Self {
            default_max_attempts: default_max_attempts.max(1),
            per_type: HashMap::new(),
        }
    }

    pub fn with_type(mut self, task_type: impl Into<String>, max_attempts: u32) -> Self {
        self.per_type.insert(task_type.into(), max_attempts.max(1));
        self
    }

    pub fn resolve(&self, task_type: &str, explicit: Option<u32>) -> u32 {
        explicit
            .or_else(|| self.per_type.get(task_type).copied())
            .unwrap_or(self.default_max_attempts)
            .max(1)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
