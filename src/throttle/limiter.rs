//! Token pacing for rate-limited endpoints.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const COOL_DOWN: Duration = Duration::from_secs(60);
const MAX_SPACING: Duration = Duration::from_secs(30);

/// Per-endpoint-class pacing parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimiterSettings {
    /// Minimum spacing between successive requests, in milliseconds.
    pub base_delay_ms: u64,
    /// Rolling one-minute request budget.
    pub max_requests_per_minute: u32,
}

impl LimiterSettings {
    pub const fn new(base_delay_ms: u64, max_requests_per_minute: u32) -> Self {
        Self {
            base_delay_ms,
            max_requests_per_minute,
        }
    }
}

struct LimiterState {
    next_allowed: Instant,
    spacing: Duration,
    widened_until: Option<Instant>,
    window: VecDeque<Instant>,
}

/// Enforces a minimum spacing and a rolling per-minute budget.
///
/// On a provider throttle signal the spacing widens multiplicatively for a
/// cool-down interval and relaxes back to the base afterwards. All token
/// state sits under one mutex; waiting happens outside it.
pub struct RateLimiter {
    name: &'static str,
    base_spacing: Duration,
    max_per_minute: usize,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(name: &'static str, settings: LimiterSettings) -> Self {
        let base_spacing = Duration::from_millis(settings.base_delay_ms);
        Self {
            name,
            base_spacing,
            max_per_minute: settings.max_requests_per_minute.max(1) as usize,
            state: Mutex::new(LimiterState {
                next_allowed: Instant::now(),
                spacing: base_spacing,
                widened_until: None,
                window: VecDeque::new(),
            }),
        }
    }

    /// Wait until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();

                if state.widened_until.is_some_and(|until| now >= until) {
                    debug!("{} limiter cool-down over, spacing restored", self.name);
                    state.spacing = self.base_spacing;
                    state.widened_until = None;
                }
                while state.window.front().is_some_and(|t| now - *t >= WINDOW) {
                    state.window.pop_front();
                }

                let mut wait = Duration::ZERO;
                if now < state.next_allowed {
                    wait = state.next_allowed - now;
                }
                if state.window.len() >= self.max_per_minute {
                    let oldest = *state.window.front().expect("window is non-empty");
                    wait = wait.max(oldest + WINDOW - now);
                }

                if wait.is_zero() {
                    let spacing = state.spacing;
                    state.next_allowed = now + spacing;
                    state.window.push_back(now);
                }
                wait
            };

            if wait.is_zero() {
                return;
            }
            sleep(wait).await;
        }
    }

    /// Widen the spacing after a provider throttle signal; returns the
    /// suggested wait before the retry.
    pub fn on_rate_limited(&self, retry_after: Option<u64>) -> Duration {
        let mut state = self.state.lock();
        let widened = (state.spacing * 2).min(MAX_SPACING).max(self.base_spacing * 2);
        state.spacing = widened;
        state.widened_until = Some(Instant::now() + COOL_DOWN);
        warn!(
            "{} limiter widened to {:?} for {:?} after throttle signal",
            self.name, widened, COOL_DOWN
        );
        retry_after
            .map(Duration::from_secs)
            .unwrap_or(widened)
            .max(widened)
    }

    #[cfg(test)]
    fn current_spacing(&self) -> Duration {
        self.state.lock().spacing
    }
}

/// The shared limiters, one per endpoint class.
pub struct EndpointLimiters {
    pub spot: Arc<RateLimiter>,
    pub futures: Arc<RateLimiter>,
    pub heavy: Arc<RateLimiter>,
    pub batch: Arc<RateLimiter>,
}

impl EndpointLimiters {
    pub fn new(
        spot: LimiterSettings,
        futures: LimiterSettings,
        heavy: LimiterSettings,
        batch: LimiterSettings,
    ) -> Self {
        Self {
            spot: Arc::new(RateLimiter::new("spot", spot)),
            futures: Arc::new(RateLimiter::new("futures", futures)),
            heavy: Arc::new(RateLimiter::new("heavy", heavy)),
            batch: Arc::new(RateLimiter::new("batch", batch)),
        }
    }
}

impl Default for EndpointLimiters {
    fn default() -> Self {
        Self::new(
            LimiterSettings::new(600, 1200),
            LimiterSettings::new(300, 1800),
            LimiterSettings::new(1000, 600),
            LimiterSettings::new(800, 1000),
        )
    }
}

impl EndpointLimiters {
    /// Zero-spacing limiters for tests that exercise request logic rather
    /// than pacing.
    pub fn unthrottled() -> Self {
        let fast = LimiterSettings::new(0, u32::MAX);
        Self::new(fast, fast, fast, fast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_spacing() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(500, 1000));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(Instant::now() - start >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_minute_budget() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 3));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(Instant::now() - start < Duration::from_secs(1));
        // Fourth slot only opens when the oldest leaves the window.
        limiter.acquire().await;
        assert!(Instant::now() - start >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn widens_then_recovers_after_cool_down() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(400, 1000));
        assert_eq!(limiter.current_spacing(), Duration::from_millis(400));

        let wait = limiter.on_rate_limited(None);
        assert_eq!(limiter.current_spacing(), Duration::from_millis(800));
        assert!(wait >= Duration::from_millis(800));

        let wait = limiter.on_rate_limited(Some(90));
        assert!(wait >= Duration::from_secs(90));

        tokio::time::advance(COOL_DOWN + Duration::from_secs(1)).await;
        limiter.acquire().await;
        assert_eq!(limiter.current_spacing(), Duration::from_millis(400));
    }
}
