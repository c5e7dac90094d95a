// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Backoff
//!
//! A single exponential-backoff-with-cap policy shared by the publisher and the
//! consumer loop, so both sides retry the broker the same way and tests can
//! shrink the intervals.

use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff: `initial * multiplier^(attempt - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl Backoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    ///
    /// A `max` lower than `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// Sets the growth factor between two consecutive attempts.
    ///
    /// Factors below `1.0` are clamped to `1.0` (constant delay).
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = (attempt - 1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);

        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }

        Duration::from_millis(millis as u64)
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
