//! # Reconnect Backoff
//!
//! Pure mapping from a reconnect attempt number to the delay before that attempt.
//!
//! `delay = min(min_delay * factor^attempt, max_delay)`, then up to
//! `±jitter * delay` of uniform noise, floored at `min_delay`. With
//! `immediate_first_attempt`, attempt 0 is always zero.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Parameters of the exponential backoff curve.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub immediate_first_attempt: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay used as symmetric noise, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            immediate_first_attempt: true,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    pub fn immediate_first_attempt(mut self, immediate: bool) -> Self {
        self.immediate_first_attempt = immediate;
        self
    }

    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay before reconnect attempt `attempt`, with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_sample(attempt, sample)
    }

    /// Deterministic core of [`BackoffConfig::delay`].
    ///
    /// `sample` is the jitter draw in `-1.0..=1.0`; `0.0` yields the undisturbed curve.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        if self.immediate_first_attempt && attempt == 0 {
            return Duration::ZERO;
        }

        let min_ms = self.min_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = (min_ms * self.factor.powi(exponent)).min(max_ms);
        let noisy = base + sample.clamp(-1.0, 1.0) * self.jitter * base;

        Duration::from_secs_f64(noisy.max(min_ms) / 1000.0)
    }
}

/// How a reconnecting transport picks its delays.
#[derive(Clone)]
pub enum ReconnectDelay {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// Caller-supplied curve.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
    Exponential(BackoffConfig),
}

impl ReconnectDelay {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Custom(curve) => curve(attempt),
            Self::Exponential(config) => config.delay(attempt),
        }
    }
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        Self::Exponential(BackoffConfig::default())
    }
}

impl fmt::Debug for ReconnectDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Exponential(config) => f.debug_tuple("Exponential").field(config).finish(),
        }
    }
}

impl From<Duration> for ReconnectDelay {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl From<BackoffConfig> for ReconnectDelay {
    fn from(config: BackoffConfig) -> Self {
        Self::Exponential(config)
    }
}
