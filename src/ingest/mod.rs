//! Concurrent downloaders: K-lines, derived metrics, and bulk archives.

mod kline;
mod metrics;
mod vision;

use std::future::Future;

use tokio::time::sleep;
use tracing::warn;

use crate::client::ClientError;
use crate::models::PerpKline;
use crate::throttle::{should_retry, ExponentialBackoff, RateLimiter, RetryConfig};

pub use kline::{KlineDownloadOptions, KlineDownloader};
pub use metrics::{MetricsDownloadOptions, MetricsDownloader};
pub use vision::VisionDownloader;

/// Run one provider call under the shared pacing and retry policy.
///
/// Rate-limit signals widen the limiter and wait without consuming retry
/// budget; transient failures back off exponentially up to the cap;
/// invalid-symbol and auth failures surface immediately.
pub(crate) async fn fetch_with_policy<T, F, Fut>(
    what: &str,
    limiter: &RateLimiter,
    retry: RetryConfig,
    op: F,
) -> Result<T, ClientError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut backoff = ExponentialBackoff::new(retry);
    loop {
        limiter.acquire().await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(ClientError::RateLimited { retry_after }) => {
                let wait = limiter.on_rate_limited(retry_after);
                warn!("{what}: throttled, waiting {wait:?}");
                sleep(wait).await;
                backoff.reset();
            }
            Err(err) => {
                if !should_retry(&err, backoff.attempt(), retry.max_retries) {
                    return Err(err);
                }
                warn!(
                    "{what}: attempt {} failed ({err}), backing off",
                    backoff.attempt() + 1
                );
                if !backoff.wait().await {
                    return Err(err);
                }
            }
        }
    }
}

/// Parse and validate raw K-line rows for one symbol. Invalid rows are
/// dropped; a warning fires when more than 10% of a batch is dropped.
/// Bar alignment to the frequency stride is spot-checked, not enforced.
pub(crate) fn validate_klines(
    symbol: &str,
    rows: &[crate::models::RawKlineRow],
    stride_ms: Option<i64>,
) -> Vec<PerpKline> {
    let mut valid = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    let mut misaligned = 0usize;

    for row in rows {
        match PerpKline::from_raw(symbol, row) {
            Ok(kline) if kline.is_valid() => {
                if let Some(stride) = stride_ms {
                    if kline.open_time % stride != 0 {
                        misaligned += 1;
                    }
                }
                valid.push(kline);
            }
            _ => dropped += 1,
        }
    }

    if dropped > 0 && dropped * 10 > rows.len() {
        warn!(
            "{symbol}: dropped {dropped}/{} rows failing validation",
            rows.len()
        );
    }
    if misaligned > 0 {
        warn!("{symbol}: {misaligned} bars not aligned to the frequency stride");
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::LimiterSettings;
    use parking_lot::Mutex;
    use serde_json::json;

    fn raw(open_time: i64, high: &str) -> crate::models::RawKlineRow {
        vec![
            json!(open_time),
            json!("100"),
            json!(high),
            json!("90"),
            json!("105"),
            json!("10"),
            json!(open_time + 59_999),
            json!("1000"),
            json!(5),
            json!("4"),
            json!("400"),
            json!("0"),
        ]
    }

    #[test]
    fn validation_drops_bad_rows_and_keeps_good() {
        let rows = vec![raw(0, "110"), raw(60_000, "10"), raw(120_000, "110")];
        let valid = validate_klines("BTCUSDT", &rows, Some(60_000));
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].open_time, 0);
        assert_eq!(valid[1].open_time, 120_000);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_retries_transient_until_success() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 100_000));
        let attempts = Mutex::new(0u32);
        let out = fetch_with_policy("op", &limiter, RetryConfig::default(), || async {
            let mut n = attempts.lock();
            *n += 1;
            if *n < 3 {
                Err(ClientError::Transient("flaky".into()))
            } else {
                Ok(*n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_gives_up_after_budget() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 100_000));
        let retry = RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        };
        let attempts = Mutex::new(0u32);
        let out: Result<(), _> = fetch_with_policy("op", &limiter, retry, || async {
            *attempts.lock() += 1;
            Err(ClientError::Transient("down".into()))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(*attempts.lock(), 3); // initial try + two retries
    }

    #[tokio::test(start_paused = true)]
    async fn policy_never_retries_invalid_symbol() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 100_000));
        let attempts = Mutex::new(0u32);
        let out: Result<(), _> =
            fetch_with_policy("op", &limiter, RetryConfig::default(), || async {
                *attempts.lock() += 1;
                Err(ClientError::InvalidSymbol("NOPEUSDT".into()))
            })
            .await;
        assert!(out.unwrap_err().is_invalid_symbol());
        assert_eq!(*attempts.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_never_retries_auth_failures() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 100_000));
        let attempts = Mutex::new(0u32);
        let out: Result<(), _> =
            fetch_with_policy("op", &limiter, RetryConfig::default(), || async {
                *attempts.lock() += 1;
                Err(ClientError::Unauthorized("401".into()))
            })
            .await;
        assert!(out.unwrap_err().is_unauthorized());
        assert_eq!(*attempts.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_do_not_consume_retry_budget() {
        let limiter = RateLimiter::new("test", LimiterSettings::new(0, 100_000));
        let retry = RetryConfig {
            max_retries: 1,
            ..RetryConfig::default()
        };
        let attempts = Mutex::new(0u32);
        let out = fetch_with_policy("op", &limiter, retry, || async {
            let mut n = attempts.lock();
            *n += 1;
            // Three throttle signals in a row, then success: would exhaust
            // a 1-retry budget if throttling counted against it.
            if *n <= 3 {
                Err(ClientError::RateLimited { retry_after: Some(1) })
            } else {
                Ok(*n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 4);
    }
}
