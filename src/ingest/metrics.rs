//! Metrics downloaders: funding rate, open interest, long/short ratio.
//!
//! Same worker-pool skeleton as the K-line downloader, one run per metric
//! class. Class-specific provider constraints live here: funding history is
//! unrestricted (limit 1000), open interest and the four ratio endpoints
//! cap `limit` at 500, and the ratio endpoints only serve the last 30 days
//! (earlier requests are clamped with a warning).

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ExchangeClient};
use crate::error::PipelineError;
use crate::ingest::fetch_with_policy;
use crate::models::{
    Freq, FundingRate, IntegrityReport, LongShortRatio, MissingPeriod, OpenInterest, RatioType,
};
use crate::storage::MarketStore;
use crate::throttle::{EndpointLimiters, RetryConfig};
use crate::time;

const PROVIDER_RATIO_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct MetricsDownloadOptions {
    pub pool_size: usize,
    pub retry: RetryConfig,
    /// Overall wall-clock budget for one symbol's fetch-and-store cycle.
    pub symbol_timeout_secs: u64,
}

impl Default for MetricsDownloadOptions {
    fn default() -> Self {
        Self {
            pool_size: 5,
            retry: RetryConfig::default(),
            symbol_timeout_secs: 300,
        }
    }
}

pub struct MetricsDownloader {
    client: Arc<dyn ExchangeClient>,
    store: MarketStore,
    limiters: Arc<EndpointLimiters>,
}

impl MetricsDownloader {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: MarketStore,
        limiters: Arc<EndpointLimiters>,
    ) -> Self {
        Self {
            client,
            store,
            limiters,
        }
    }

    /// Funding-rate history for every symbol over `[start_date, end_date]`.
    pub async fn download_funding_rates(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        opts: &MetricsDownloadOptions,
    ) -> Result<IntegrityReport> {
        if symbols.is_empty() {
            return Ok(IntegrityReport::empty());
        }
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, Freq::D1)?;
        info!("funding rate download: {} symbols", symbols.len());

        let limiter = Arc::clone(&self.limiters.futures);
        let outcomes = self
            .run_pool(symbols, opts, |symbol| {
                let limiter = Arc::clone(&limiter);
                let retry = opts.retry;
                async move {
                    let rows =
                        fetch_with_policy(&format!("funding:{symbol}"), &limiter, retry, || {
                            self.client
                                .get_funding_rate(&symbol, Some(start_ms), Some(end_ms), 1000)
                        })
                        .await?;
                    let parsed: Vec<FundingRate> = rows
                        .iter()
                        .filter_map(|obj| match FundingRate::from_provider(obj) {
                            Ok(fr) => Some(fr),
                            Err(e) => {
                                warn!("{symbol}: dropping funding row: {e}");
                                None
                            }
                        })
                        .collect();
                    self.store
                        .insert_funding_rates(&parsed)
                        .await
                        .map_err(|e| ClientError::Other(format!("storage failure: {e}")))
                }
            })
            .await?;

        Ok(build_report(symbols, outcomes, start_date, end_date, "funding rate"))
    }

    /// Open-interest history at `period` (default 5m at the call sites).
    pub async fn download_open_interest(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        period: Freq,
        opts: &MetricsDownloadOptions,
    ) -> Result<IntegrityReport> {
        if symbols.is_empty() {
            return Ok(IntegrityReport::empty());
        }
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, Freq::D1)?;
        info!("open interest download: {} symbols @ {period}", symbols.len());

        let limiter = Arc::clone(&self.limiters.heavy);
        let outcomes = self
            .run_pool(symbols, opts, |symbol| {
                let limiter = Arc::clone(&limiter);
                let retry = opts.retry;
                async move {
                    let rows = fetch_with_policy(&format!("oi:{symbol}"), &limiter, retry, || {
                        self.client.get_open_interest_hist(
                            &symbol,
                            period.as_str(),
                            Some(start_ms),
                            Some(end_ms),
                            500,
                        )
                    })
                    .await?;
                    let parsed: Vec<OpenInterest> = rows
                        .iter()
                        .filter_map(|obj| {
                            match OpenInterest::from_provider(obj, period.as_str()) {
                                Ok(oi) => Some(oi),
                                Err(e) => {
                                    warn!("{symbol}: dropping open interest row: {e}");
                                    None
                                }
                            }
                        })
                        .collect();
                    self.store
                        .insert_open_interest(&parsed)
                        .await
                        .map_err(|e| ClientError::Other(format!("storage failure: {e}")))
                }
            })
            .await?;

        Ok(build_report(symbols, outcomes, start_date, end_date, "open interest"))
    }

    /// Long/short ratio history for one ratio type. The provider restricts
    /// the window to the last 30 days; earlier start dates are clamped.
    pub async fn download_long_short_ratio(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        period: &str,
        ratio_type: RatioType,
        opts: &MetricsDownloadOptions,
    ) -> Result<IntegrityReport> {
        if symbols.is_empty() {
            return Ok(IntegrityReport::empty());
        }
        let start_date = self.clamp_to_provider_window(start_date)?;
        let (start_ms, end_ms) = time::date_range_ms(&start_date, end_date, Freq::D1)?;
        info!(
            "long/short ratio download: {} symbols, type {ratio_type}, period {period}",
            symbols.len()
        );

        let limiter = Arc::clone(&self.limiters.heavy);
        let period_owned = period.to_string();
        let outcomes = self
            .run_pool(symbols, opts, |symbol| {
                let limiter = Arc::clone(&limiter);
                let retry = opts.retry;
                let period = period_owned.clone();
                async move {
                    let rows = fetch_with_policy(
                        &format!("lsr:{}:{symbol}", ratio_type.as_str()),
                        &limiter,
                        retry,
                        || {
                            self.client.get_long_short_ratio(
                                &symbol,
                                &period,
                                ratio_type,
                                Some(start_ms),
                                Some(end_ms),
                                500,
                            )
                        },
                    )
                    .await?;
                    let parsed: Vec<LongShortRatio> = rows
                        .iter()
                        .filter_map(|obj| {
                            match LongShortRatio::from_provider(obj, &period, ratio_type) {
                                Ok(lsr) => Some(lsr),
                                Err(e) => {
                                    warn!("{symbol}: dropping ratio row: {e}");
                                    None
                                }
                            }
                        })
                        .collect();
                    self.store
                        .insert_long_short_ratios(&parsed)
                        .await
                        .map_err(|e| ClientError::Other(format!("storage failure: {e}")))
                }
            })
            .await?;

        Ok(build_report(
            symbols,
            outcomes,
            &start_date,
            end_date,
            ratio_type.as_str(),
        ))
    }

    fn clamp_to_provider_window(&self, start_date: &str) -> Result<String> {
        let start = time::parse_date(start_date)?;
        let earliest = (Utc::now() - Duration::days(PROVIDER_RATIO_WINDOW_DAYS)).date_naive();
        if start < earliest {
            let clamped = earliest.format("%Y-%m-%d").to_string();
            warn!(
                "ratio start {start_date} is outside the provider's {PROVIDER_RATIO_WINDOW_DAYS}-day window, clamping to {clamped}"
            );
            Ok(clamped)
        } else {
            Ok(time::standardize_date(start_date)?)
        }
    }

    async fn run_pool<'a, F, Fut>(
        &'a self,
        symbols: &[String],
        opts: &MetricsDownloadOptions,
        per_symbol: F,
    ) -> Result<Vec<(String, Result<usize, ClientError>)>>
    where
        F: Fn(String) -> Fut + Sync,
        Fut: std::future::Future<Output = Result<usize, ClientError>> + 'a,
    {
        let auth_failure: Mutex<Option<String>> = Mutex::new(None);
        let budget = std::time::Duration::from_secs(opts.symbol_timeout_secs.max(1));
        let outcomes: Vec<(String, Result<usize, ClientError>)> =
            stream::iter(symbols.iter().cloned())
                .map(|symbol| {
                    let per_symbol = &per_symbol;
                    let auth_failure = &auth_failure;
                    async move {
                        let result =
                            match tokio::time::timeout(budget, per_symbol(symbol.clone())).await {
                                Ok(result) => result,
                                Err(_) => Err(ClientError::Other(format!(
                                    "symbol budget of {budget:?} exceeded"
                                ))),
                            };
                        if let Err(err) = &result {
                            if err.is_unauthorized() {
                                *auth_failure.lock() = Some(err.to_string());
                            }
                        }
                        (symbol, result)
                    }
                })
                .buffer_unordered(opts.pool_size.max(1))
                .collect()
                .await;

        if let Some(reason) = auth_failure.lock().take() {
            return Err(PipelineError::Auth(reason).into());
        }
        Ok(outcomes)
    }
}

fn build_report(
    symbols: &[String],
    outcomes: Vec<(String, Result<usize, ClientError>)>,
    start_date: &str,
    end_date: &str,
    what: &str,
) -> IntegrityReport {
    let period = format!("{start_date} - {end_date}");
    let mut successful = 0usize;
    let mut failed = Vec::new();
    let mut missing = Vec::new();

    for (symbol, outcome) in outcomes {
        match outcome {
            Ok(records) => {
                debug!("{symbol}: {records} {what} records");
                successful += 1;
                if records == 0 {
                    missing.push(MissingPeriod {
                        symbol,
                        period: period.clone(),
                        reason: "no data in window".into(),
                    });
                }
            }
            Err(err) => {
                let reason = if err.is_invalid_symbol() {
                    format!("invalid symbol: {err}")
                } else {
                    err.to_string()
                };
                missing.push(MissingPeriod {
                    symbol: symbol.clone(),
                    period: period.clone(),
                    reason,
                });
                failed.push(symbol);
            }
        }
    }

    let total = symbols.len();
    let score = if total > 0 {
        successful as f64 / total as f64
    } else {
        1.0
    };
    let mut recommendations = Vec::new();
    if !failed.is_empty() {
        recommendations.push(format!("{} symbols failed the {what} download", failed.len()));
    }
    info!("{what} download finished: {successful}/{total} successful");

    IntegrityReport {
        total_symbols: total,
        successful_symbols: successful,
        failed_symbols: failed,
        missing_periods: missing,
        data_quality_score: score,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockExchange;
    use serde_json::json;

    const DAY0: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    fn downloader(mock: Arc<MockExchange>) -> (MetricsDownloader, MarketStore) {
        let store = MarketStore::in_memory().unwrap();
        let downloader = MetricsDownloader::new(
            mock,
            store.clone(),
            Arc::new(EndpointLimiters::unthrottled()),
        );
        (downloader, store)
    }

    fn opts() -> MetricsDownloadOptions {
        MetricsDownloadOptions {
            pool_size: 2,
            retry: RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 1.0,
                jitter: false,
            },
            ..MetricsDownloadOptions::default()
        }
    }

    #[tokio::test]
    async fn funding_rates_are_fetched_and_stored() {
        let mock = Arc::new(MockExchange::default());
        mock.set_funding(
            "BTCUSDT",
            vec![
                json!({"symbol": "BTCUSDT", "fundingTime": DAY0 + 1, "fundingRate": "0.0001"}),
                json!({"symbol": "BTCUSDT", "fundingTime": DAY0 + 2, "fundingRate": "0.0002"}),
                json!({"symbol": "BTCUSDT", "fundingTime": DAY0 + 3, "bogus": true}),
            ],
        );
        let (downloader, store) = downloader(mock);

        let report = downloader
            .download_funding_rates(&["BTCUSDT".into()], "2024-01-01", "2024-01-01", &opts())
            .await
            .unwrap();
        assert_eq!(report.successful_symbols, 1);
        // The malformed row was dropped, the two good rows stored.
        assert_eq!(store.data_summary().await.unwrap().funding_rate.rows, 2);
    }

    #[tokio::test]
    async fn open_interest_uses_requested_period() {
        let mock = Arc::new(MockExchange::default());
        mock.set_open_interest(
            "BTCUSDT",
            vec![json!({
                "symbol": "BTCUSDT",
                "timestamp": DAY0 + 300_000,
                "sumOpenInterest": "80000.5",
                "sumOpenInterestValue": "3400000000.0"
            })],
        );
        let (downloader, store) = downloader(mock);

        downloader
            .download_open_interest(
                &["BTCUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::M5,
                &opts(),
            )
            .await
            .unwrap();

        let conn = store.pool().acquire().await;
        let interval: String = conn
            .query_row("SELECT interval FROM open_interest", [], |row| row.get(0))
            .unwrap();
        assert_eq!(interval, "5m");
    }

    #[tokio::test]
    async fn ratio_start_is_clamped_to_the_provider_window() {
        let mock = Arc::new(MockExchange::default());
        let (downloader, _store) = downloader(Arc::clone(&mock));

        let old_start = (Utc::now() - Duration::days(90))
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();
        let end = Utc::now().date_naive().format("%Y-%m-%d").to_string();

        downloader
            .download_long_short_ratio(
                &["BTCUSDT".into()],
                &old_start,
                &end,
                "5m",
                RatioType::GlobalAccount,
                &opts(),
            )
            .await
            .unwrap();

        let requests = mock.ratio_requests();
        assert_eq!(requests.len(), 1);
        let earliest_allowed =
            (Utc::now() - Duration::days(PROVIDER_RATIO_WINDOW_DAYS + 1)).timestamp_millis();
        assert!(requests[0].start_ms.unwrap() >= earliest_allowed);
        assert_eq!(requests[0].ratio_type, RatioType::GlobalAccount);
    }

    #[tokio::test]
    async fn ratio_rows_store_under_their_type() {
        // Ratio windows clamp to the last 30 days, so the fixture must be
        // recent.
        let start = (Utc::now() - Duration::days(2))
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();
        let end = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let row_ts = (Utc::now() - Duration::days(1)).timestamp_millis();

        let mock = Arc::new(MockExchange::default());
        mock.set_ratio(
            "BTCUSDT",
            RatioType::TakerVol,
            vec![json!({
                "symbol": "BTCUSDT",
                "timestamp": row_ts,
                "buySellRatio": "1.4",
                "buyVol": "70.0",
                "sellVol": "50.0"
            })],
        );
        let (downloader, store) = downloader(mock);

        downloader
            .download_long_short_ratio(
                &["BTCUSDT".into()],
                &start,
                &end,
                "5m",
                RatioType::TakerVol,
                &opts(),
            )
            .await
            .unwrap();

        let conn = store.pool().acquire().await;
        let (ratio_type, value): (String, f64) = conn
            .query_row(
                "SELECT ratio_type, long_short_ratio FROM long_short_ratio",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(ratio_type, "taker_vol");
        assert!((value - 1.4).abs() < 1e-9);
    }
}
