//! K-line downloader: completeness-gated, multi-round, worker-pooled.
//!
//! Symbols whose stored data already covers the window are skipped; the
//! rest are processed by a fixed-size pool in up to `max_rounds` rounds,
//! failures staying pending between rounds. A symbol that fails with
//! `InvalidSymbol` is final immediately and never retried.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ExchangeClient, Market};
use crate::ingest::{fetch_with_policy, validate_klines};
use crate::models::{Freq, IntegrityReport, MissingPeriod};
use crate::storage::MarketStore;
use crate::throttle::{EndpointLimiters, RetryConfig};
use crate::time;

#[derive(Debug, Clone)]
pub struct KlineDownloadOptions {
    /// Fraction of expected bars that counts as already complete.
    /// 1.0 for an explicit rerun; 0.95 is the resume default.
    pub completeness_threshold: f64,
    pub max_rounds: u32,
    pub pool_size: usize,
    pub retry: RetryConfig,
    pub market: Market,
    pub request_limit: u32,
    /// Overall wall-clock budget for one symbol's fetch-and-store cycle.
    pub symbol_timeout_secs: u64,
}

impl Default for KlineDownloadOptions {
    fn default() -> Self {
        Self {
            completeness_threshold: 1.0,
            max_rounds: 3,
            pool_size: 5,
            retry: RetryConfig::default(),
            market: Market::Futures,
            request_limit: 1500,
            symbol_timeout_secs: 300,
        }
    }
}

enum SymbolOutcome {
    Stored(usize),
    Empty,
    Invalid(String),
    Failed(String),
}

pub struct KlineDownloader {
    client: Arc<dyn ExchangeClient>,
    store: MarketStore,
    limiters: Arc<EndpointLimiters>,
}

impl KlineDownloader {
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

    /// Download `[start_date, end_date]` at `freq` for every symbol and
    /// report the outcome. Auth failures abort; everything else degrades to
    /// per-symbol failures in the report.
    pub async fn download_klines(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        freq: Freq,
        opts: &KlineDownloadOptions,
    ) -> Result<IntegrityReport> {
        if symbols.is_empty() {
            return Ok(IntegrityReport::empty());
        }
        let start_date = time::standardize_date(start_date)?;
        let end_date = time::standardize_date(end_date)?;
        let (start_ms, end_ms) = time::date_range_ms(&start_date, &end_date, freq)?;

        info!(
            "kline download: {} symbols, {start_date}..{end_date} @ {freq}",
            symbols.len()
        );

        let (mut pending, complete) = self
            .partition_by_completeness(symbols, &start_date, &end_date, freq, opts)
            .await?;
        info!(
            "completeness check: {} to download, {} already complete",
            pending.len(),
            complete.len()
        );

        let mut successful: Vec<String> = complete;
        let mut invalid: Vec<MissingPeriod> = Vec::new();
        let mut last_errors: Vec<MissingPeriod> = Vec::new();
        let period = format!("{start_date} - {end_date}");

        for round in 0..opts.max_rounds.max(1) {
            if pending.is_empty() {
                break;
            }
            debug!("round {round}: {} symbols", pending.len());
            let outcomes = self
                .run_round(&pending, start_ms, end_ms, freq, opts)
                .await?;

            let mut next_round = Vec::new();
            last_errors.clear();
            for (symbol, outcome) in outcomes {
                match outcome {
                    SymbolOutcome::Stored(records) => {
                        debug!("{symbol}: {records} records");
                        successful.push(symbol);
                    }
                    SymbolOutcome::Empty => {
                        // An empty window is an answer, not a failure.
                        successful.push(symbol.clone());
                        invalid.push(MissingPeriod {
                            symbol,
                            period: period.clone(),
                            reason: "no data in window".into(),
                        });
                    }
                    SymbolOutcome::Invalid(reason) => {
                        warn!("{symbol}: invalid symbol, skipping");
                        invalid.push(MissingPeriod {
                            symbol,
                            period: period.clone(),
                            reason: format!("invalid symbol: {reason}"),
                        });
                    }
                    SymbolOutcome::Failed(reason) => {
                        last_errors.push(MissingPeriod {
                            symbol: symbol.clone(),
                            period: period.clone(),
                            reason,
                        });
                        next_round.push(symbol);
                    }
                }
            }
            pending = next_round;
        }

        let mut failed: Vec<String> = pending.clone();
        failed.extend(
            invalid
                .iter()
                .filter(|m| m.reason.starts_with("invalid symbol"))
                .map(|m| m.symbol.clone()),
        );
        let mut missing_periods = invalid;
        missing_periods.extend(last_errors);

        self.build_report(
            symbols,
            successful,
            failed,
            missing_periods,
            &start_date,
            &end_date,
            freq,
        )
        .await
    }

    async fn partition_by_completeness(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        freq: Freq,
        opts: &KlineDownloadOptions,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, freq)?;
        let expected = time::expected_points(end_ms - start_ms + 1, freq)?;

        let mut need = Vec::new();
        let mut complete = Vec::new();
        for symbol in symbols {
            let actual = self
                .store
                .count_klines(symbol, start_date, end_date, freq)
                .await
                .unwrap_or(0);
            let completeness = actual as f64 / expected as f64;
            if completeness >= opts.completeness_threshold {
                debug!("{symbol}: complete ({actual}/{expected})");
                complete.push(symbol.clone());
            } else {
                need.push(symbol.clone());
            }
        }
        Ok((need, complete))
    }

    async fn run_round(
        &self,
        symbols: &[String],
        start_ms: i64,
        end_ms: i64,
        freq: Freq,
        opts: &KlineDownloadOptions,
    ) -> Result<Vec<(String, SymbolOutcome)>> {
        let auth_failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let outcomes: Vec<(String, SymbolOutcome)> = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let auth_failure = Arc::clone(&auth_failure);
                async move {
                    let budget = std::time::Duration::from_secs(opts.symbol_timeout_secs.max(1));
                    let outcome = match tokio::time::timeout(
                        budget,
                        self.process_symbol(&symbol, start_ms, end_ms, freq, opts),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // Partial writes from the aborted cycle are valid
                            // rows; the next run resumes past them.
                            Err(ClientError::Other(format!(
                                "symbol budget of {budget:?} exceeded"
                            )))
                        }
                    };
                    let outcome = match outcome {
                        Ok(0) => SymbolOutcome::Empty,
                        Ok(records) => SymbolOutcome::Stored(records),
                        Err(ClientError::InvalidSymbol(reason)) => SymbolOutcome::Invalid(reason),
                        Err(err @ ClientError::Unauthorized(_)) => {
                            *auth_failure.lock() = Some(err.to_string());
                            SymbolOutcome::Failed(err.to_string())
                        }
                        Err(err) => SymbolOutcome::Failed(err.to_string()),
                    };
                    (symbol, outcome)
                }
            })
            .buffer_unordered(opts.pool_size.max(1))
            .collect()
            .await;

        // Bad credentials poison every request; stop instead of grinding
        // through the whole symbol list.
        if let Some(reason) = auth_failure.lock().take() {
            return Err(crate::error::PipelineError::Auth(reason).into());
        }
        Ok(outcomes)
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        freq: Freq,
        opts: &KlineDownloadOptions,
    ) -> Result<usize, ClientError> {
        let rows = fetch_with_policy(symbol, &self.limiters.futures, opts.retry, || {
            self.client.get_historical_klines(
                symbol,
                freq.as_str(),
                start_ms,
                end_ms,
                opts.request_limit,
                opts.market,
            )
        })
        .await?;

        if rows.is_empty() {
            return Ok(0);
        }
        let valid = validate_klines(symbol, &rows, freq.stride_ms());
        if valid.is_empty() {
            return Ok(0);
        }
        let written = self
            .store
            .insert_klines(&valid, freq)
            .await
            .map_err(|e| ClientError::Other(format!("storage failure: {e}")))?;
        Ok(written)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_report(
        &self,
        symbols: &[String],
        successful: Vec<String>,
        failed: Vec<String>,
        missing_periods: Vec<MissingPeriod>,
        start_date: &str,
        end_date: &str,
        freq: Freq,
    ) -> Result<IntegrityReport> {
        let total = symbols.len();
        let success_count = successful.len().min(total);
        let base_score = if total > 0 {
            success_count as f64 / total as f64
        } else {
            1.0
        };

        // Sampled completeness over up to 10 successful symbols; each
        // incomplete sample shaves up to 30% off the base score.
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, freq)?;
        let expected = time::expected_points(end_ms - start_ms + 1, freq)?;
        let sample: Vec<&String> = successful.iter().take(10).collect();
        let mut quality_issues = 0usize;
        for symbol in &sample {
            let actual = self
                .store
                .count_klines(symbol, start_date, end_date, freq)
                .await
                .unwrap_or(0);
            if (actual as f64) < expected as f64 * 0.8 {
                quality_issues += 1;
            }
        }
        let penalty = if sample.is_empty() {
            0.0
        } else {
            (quality_issues as f64 / sample.len() as f64) * 0.3
        };
        let score = (base_score - penalty).max(0.0);

        let mut recommendations = Vec::new();
        if score < 0.5 {
            recommendations.push("data quality is poor; re-run the download".to_string());
        } else if score < 0.8 {
            recommendations.push("data quality is mixed; inspect the failed symbols".to_string());
        }
        if !failed.is_empty() {
            recommendations.push(format!(
                "{} symbols failed; re-running resumes where this run stopped",
                failed.len()
            ));
        }
        if quality_issues > 0 {
            recommendations.push(format!(
                "{quality_issues} sampled symbols have incomplete coverage"
            ));
        }

        let failed: Vec<String> = {
            let mut seen = HashSet::new();
            failed
                .into_iter()
                .filter(|s| seen.insert(s.clone()))
                .collect()
        };

        info!(
            "kline download finished: {}/{} successful, score {:.2}",
            success_count, total, score
        );
        Ok(IntegrityReport {
            total_symbols: total,
            successful_symbols: success_count,
            failed_symbols: failed,
            missing_periods,
            data_quality_score: score,
            recommendations,
        })
    }
}
