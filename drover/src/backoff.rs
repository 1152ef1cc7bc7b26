//! Retry delays for failed attempts.
//!
//! Every job carries its own [`Backoff`], stored with the job so that whichever worker picks up a
//! failure computes the same delay. Three curves are provided:
//!
//! 1. Fixed
//! 2. Linear
//! 3. Exponential
//!
//! each which can be optionally clamped with a maximum and modified by applying jitter.
//!
//! # Example
//!
//! ```
//! # use drover::prelude::*;
//! # use chrono::TimeDelta;
//! let backoff = Backoff::exponential(2_000);
//!
//! assert_eq!(backoff.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(backoff.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(backoff.backoff(3), TimeDelta::seconds(8));
//! ```

use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound applied to every computed delay.
const CEILING_MS: u64 = 365 * 24 * 3600 * 1000;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far returns the [`TimeDelta`] to wait before the job
    /// should be retried.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Curve {
    /// `delay`
    Fixed,
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt - 1)`
    Exponential,
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// A random jitter in milliseconds added to the backoff in the range `-delta =< jitter =< delta`.
    AbsoluteMs(u64),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, milliseconds: u64) -> u64 {
        let spread = match self {
            Self::AbsoluteMs(delta) => (*delta).min(CEILING_MS) as i64,
            Self::Relative(ratio) => {
                (milliseconds as f64 * ratio.abs()).round().min(CEILING_MS as f64) as i64
            }
        };
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        (milliseconds as i64).saturating_add(jitter).max(0) as u64
    }
}

/// The retry delay policy of a job.
///
/// All of the constructors and configuration functions are `const`.
///
/// # Example
///
/// ```
/// # use drover::prelude::*;
/// # use chrono::TimeDelta;
/// let backoff = Backoff::linear(10_000).with_max(40_000);
///
/// assert_eq!(backoff.backoff(1), TimeDelta::seconds(10));
/// assert_eq!(backoff.backoff(2), TimeDelta::seconds(20));
/// assert_eq!(backoff.backoff(5), TimeDelta::seconds(40));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    curve: Curve,
    delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jitter: Option<Jitter>,
}

impl Backoff {
    /// Two seconds, doubled with every attempt.
    pub const DEFAULT: Backoff = Backoff::exponential(2_000);

    /// Always waits `delay_ms`.
    pub const fn fixed(delay_ms: u64) -> Self {
        Self::new(Curve::Fixed, delay_ms)
    }

    /// Waits `delay_ms * attempt`.
    pub const fn linear(delay_ms: u64) -> Self {
        Self::new(Curve::Linear, delay_ms)
    }

    /// Waits `delay_ms * 2^(attempt - 1)`.
    pub const fn exponential(delay_ms: u64) -> Self {
        Self::new(Curve::Exponential, delay_ms)
    }

    pub const fn new(curve: Curve, delay_ms: u64) -> Self {
        Self {
            curve,
            delay_ms,
            max_ms: None,
            jitter: None,
        }
    }

    /// Clamps the value returned by [`Strategy::backoff`] before jitter is applied.
    pub const fn with_max(mut self, max_ms: u64) -> Self {
        self.max_ms = Some(max_ms);
        self
    }

    /// Add a jitter to the backoff see [`Jitter`] for more information about how this affects the
    /// delay.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub const fn curve(&self) -> Curve {
        self.curve
    }

    fn base_millis(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let delay = match self.curve {
            Curve::Fixed => Some(self.delay_ms),
            Curve::Linear => self.delay_ms.checked_mul(attempt.into()),
            Curve::Exponential => 2u64
                .checked_pow(attempt - 1)
                .and_then(|factor| self.delay_ms.checked_mul(factor)),
        }
        .unwrap_or(CEILING_MS);
        match self.max_ms {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Strategy for Backoff {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut milliseconds = self.base_millis(attempt);

        if let Some(jitter) = self.jitter {
            milliseconds = jitter.apply_jitter(milliseconds);
        }

        TimeDelta::milliseconds(milliseconds.min(CEILING_MS) as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_backoff() {
        let strategy = Backoff::fixed(60_000);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), TimeDelta::minutes(1));
        }
    }

    #[test]
    fn fixed_backoff_with_absolute_jitter() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = Backoff::fixed(60_000).with_jitter(Jitter::AbsoluteMs(10_000));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn linear_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = Backoff::linear(60_000);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay * i as _);
        }
    }

    #[test]
    fn linear_backoff_with_relative_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = Backoff::linear(60_000).with_jitter(Jitter::Relative(0.1));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            let jitter = TimeDelta::seconds(6) * i as _;
            assert!(backoff >= delay * i as _ - jitter);
            assert!(backoff <= delay * i as _ + jitter);
        }
    }

    #[test]
    fn exponential_backoff() {
        let strategy = Backoff::exponential(2_000);

        for i in 1..20 {
            assert_eq!(
                strategy.backoff(i).num_milliseconds(),
                2_000 * 2i64.pow(i - 1)
            );
        }
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(10);
        let strategy = Backoff::exponential(60_000).with_max(600_000);

        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
    }

    #[test]
    fn exponential_backoff_never_overflows() {
        let strategy = Backoff::exponential(2_000);

        for i in [64, 100, u32::MAX] {
            assert_eq!(
                strategy.backoff(i).num_milliseconds(),
                CEILING_MS as i64
            );
        }
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        assert_eq!(
            Backoff::exponential(2_000).backoff(0),
            TimeDelta::seconds(2)
        );
        assert_eq!(Backoff::linear(2_000).backoff(0), TimeDelta::seconds(2));
    }

    #[test]
    fn jitter_never_goes_negative() {
        let strategy = Backoff::fixed(1_000).with_jitter(Jitter::AbsoluteMs(10_000));

        for i in 1..100 {
            assert!(strategy.backoff(i) >= TimeDelta::zero());
        }
    }

    #[test]
    fn huge_jitter_stays_within_the_ceiling() {
        for jitter in [
            Jitter::AbsoluteMs(u64::MAX),
            Jitter::AbsoluteMs(i64::MAX as u64 + 1),
            Jitter::Relative(f64::MAX),
        ] {
            let strategy = Backoff::fixed(60_000).with_jitter(jitter);

            for i in 1..20 {
                let backoff = strategy.backoff(i);
                assert!(backoff >= TimeDelta::zero());
                assert!(backoff.num_milliseconds() <= CEILING_MS as i64);
            }
        }
    }

    #[test]
    fn serializes_with_the_job() {
        let backoff = Backoff::exponential(2_000).with_max(30_000);
        let json = serde_json::to_value(backoff).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"curve": "exponential", "delay_ms": 2000, "max_ms": 30000})
        );
        assert_eq!(serde_json::from_value::<Backoff>(json).unwrap(), backoff);
    }
}
