//! Exponential backoff and failure classification.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::debug;

use crate::client::ClientError;

/// How serious a provider failure is; drives retry decisions and the
/// orchestrator's abort rule (CRITICAL aborts the run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Classify a provider failure.
pub fn classify(err: &ClientError) -> ErrorSeverity {
    match err {
        ClientError::InvalidSymbol(_) => ErrorSeverity::Low,
        ClientError::RateLimited { .. } => ErrorSeverity::Medium,
        ClientError::Transient(_) => ErrorSeverity::High,
        ClientError::Unauthorized(_) => ErrorSeverity::Critical,
        ClientError::Other(_) => ErrorSeverity::Medium,
    }
}

/// Whether a failed attempt should be retried.
///
/// Unauthorized and invalid-symbol failures are final; rate limiting is
/// handled by the limiter and does not reach this decision; everything else
/// retries while budget remains.
pub fn should_retry(err: &ClientError, attempt: u32, max_retries: u32) -> bool {
    match classify(err) {
        ErrorSeverity::Critical => false,
        ErrorSeverity::Low => false,
        _ => attempt < max_retries,
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// `delay_n = min(base * mult^n, max)`, then scaled by a random factor in
/// `[0.5, 1.0)` when jitter is on.
pub struct ExponentialBackoff {
    config: RetryConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset the attempt counter. Used after throttle waits, which do not
    /// consume retry budget.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, or `None` when the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let base = self.config.base_delay_ms as f64
            * self.config.multiplier.powi(self.attempt as i32);
        let mut delay_ms = base.min(self.config.max_delay_ms as f64);
        if self.config.jitter {
            delay_ms *= rand::thread_rng().gen_range(0.5..1.0);
        }
        self.attempt += 1;
        Some(Duration::from_millis(delay_ms as u64))
    }

    /// Sleep for the next backoff interval; `false` when exhausted.
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                debug!("backoff attempt {} sleeping {:?}", self.attempt, delay);
                sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(no_jitter(4));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn jitter_stays_in_half_open_band() {
        let mut backoff = ExponentialBackoff::new(RetryConfig {
            jitter: true,
            ..no_jitter(50)
        });
        for _ in 0..50 {
            let d = backoff.next_delay().unwrap();
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(350));
        }
    }

    #[test]
    fn reset_restores_budget() {
        let mut backoff = ExponentialBackoff::new(no_jitter(1));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn retry_decisions_follow_severity() {
        let transient = ClientError::Transient("timeout".into());
        assert!(should_retry(&transient, 0, 3));
        assert!(!should_retry(&transient, 3, 3));

        let auth = ClientError::Unauthorized("401".into());
        assert!(!should_retry(&auth, 0, 3));
        assert_eq!(classify(&auth), ErrorSeverity::Critical);

        let bad_symbol = ClientError::InvalidSymbol("NOPE".into());
        assert!(!should_retry(&bad_symbol, 0, 3));
        assert_eq!(classify(&bad_symbol), ErrorSeverity::Low);
    }
}
