// Copyright (c) James Kassemi, SC, US. All rights reserved.
use rand::Rng;
use std::time::Duration;

/// Jittered exponential backoff with a ceiling on consecutive failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_pct: f64,
    ) -> Self {
        let clamped_attempts = max_attempts.max(1);
        let clamped_base = base_delay_ms.max(1);
        let clamped_max_delay = max_delay_ms.max(clamped_base);
        let clamped_jitter = jitter_pct.clamp(0.0, 1.0);
        Self {
            max_attempts: clamped_attempts,
            base_delay_ms: clamped_base,
            max_delay_ms: clamped_max_delay,
            jitter_pct: clamped_jitter,
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: usize) -> bool {
        failures < self.max_attempts
    }

    /// Delay before the attempt that follows `failures` consecutive failures (1-based).
    pub fn delay_for(&self, failures: usize) -> Duration {
        let base = self.base_delay(failures);
        if self.jitter_pct <= 0.0 {
            return Duration::from_millis(base);
        }
        let spread = (base as f64 * self.jitter_pct) as i64;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(base.saturating_add_signed(delta))
    }

    fn base_delay(&self, failures: usize) -> u64 {
        let exponent = failures.saturating_sub(1).min(u32::MAX as usize) as u32;
        let exp = 2_u64.saturating_pow(exponent);
        self.base_delay_ms
            .saturating_mul(exp)
            .min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, 200, 30_000, 0.2)
    }
}
