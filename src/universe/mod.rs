//! Point-in-time universe selection.
//!
//! At each rebalance date the planner ranks the eligible perpetuals by
//! rolling turnover computed strictly from data available before the
//! rebalance point, and emits a snapshot whose temporal relations are
//! validated at construction. Selection is heavy on provider calls, so it
//! runs on the batch limiter with an inter-batch delay.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ExchangeClient, Market};
use crate::ingest::fetch_with_policy;
use crate::models::{
    value_f64, Freq, UniverseConfig, UniverseDefinition, UniverseSnapshot,
};
use crate::throttle::{EndpointLimiters, RetryConfig};
use crate::time;

#[derive(Debug, Clone)]
pub struct PlannerOptions {
    pub retry: RetryConfig,
    /// Symbols per pacing batch during turnover collection.
    pub batch_size: usize,
    /// Extra delay between pacing batches, milliseconds.
    pub batch_delay_ms: u64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            batch_size: 5,
            batch_delay_ms: 3_000,
        }
    }
}

pub struct UniversePlanner {
    client: Arc<dyn ExchangeClient>,
    limiters: Arc<EndpointLimiters>,
}

impl UniversePlanner {
    pub fn new(client: Arc<dyn ExchangeClient>, limiters: Arc<EndpointLimiters>) -> Self {
        Self { client, limiters }
    }

    /// Build the universe plan for `config` and persist it as JSON.
    ///
    /// `output_path` may be a file or a directory; in a directory the file
    /// name encodes the full parameter tuple.
    pub async fn define_universe(
        &self,
        config: &UniverseConfig,
        output_path: &Path,
        description: Option<String>,
        opts: &PlannerOptions,
    ) -> Result<(UniverseDefinition, PathBuf)> {
        config.validate()?;
        let start_date = time::standardize_date(&config.start_date)?;
        let end_date = time::standardize_date(&config.end_date)?;

        let rebalance_dates =
            time::generate_rebalance_dates(&start_date, &end_date, config.t2_months)?;
        info!(
            "universe plan: {} rebalances in {start_date}..{end_date} (every {} months, delay {} days)",
            rebalance_dates.len(),
            config.t2_months,
            config.delay_days
        );

        let mut existence_cache: HashMap<(String, String), bool> = HashMap::new();
        let mut snapshots = Vec::with_capacity(rebalance_dates.len());
        for (i, rebalance_date) in rebalance_dates.iter().enumerate() {
            // A universe is used strictly after its rebalance point; a
            // rebalance on the plan's final day has nothing to govern.
            if time::add_days(rebalance_date, 1)? > end_date {
                warn!("rebalance {rebalance_date}: usage window is empty, skipping");
                continue;
            }
            info!(
                "rebalance {}/{}: {rebalance_date}",
                i + 1,
                rebalance_dates.len()
            );
            let snapshot = self
                .snapshot_for(config, rebalance_date, &end_date, opts, &mut existence_cache)
                .await
                .with_context(|| format!("rebalance {rebalance_date} failed"))?;
            info!(
                "rebalance {rebalance_date}: selected {} symbols",
                snapshot.symbols.len()
            );
            snapshots.push(snapshot);
        }

        let definition = UniverseDefinition::new(config.clone(), snapshots, description)?;
        let path = if output_path.is_dir() {
            output_path.join(format!("{}.json", config.file_stem()))
        } else {
            output_path.to_path_buf()
        };
        definition.save_to_file(&path)?;
        info!("universe plan written to {}", path.display());
        Ok((definition, path))
    }

    async fn snapshot_for(
        &self,
        config: &UniverseConfig,
        rebalance_date: &str,
        plan_end_date: &str,
        opts: &PlannerOptions,
        existence_cache: &mut HashMap<(String, String), bool>,
    ) -> Result<UniverseSnapshot> {
        let t1_end = time::add_days(rebalance_date, -(config.delay_days as i64))?;
        let t1_start = time::subtract_months(&t1_end, config.t1_months)?;
        debug!("selection window {t1_start}..{t1_end}");

        let candidates = fetch_with_policy(
            "list_perpetual_symbols",
            &self.limiters.batch,
            opts.retry,
            || self.client.list_perpetual_symbols(true, &config.quote_asset),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to list perpetual symbols: {e}"))?;

        // Existence throughout the window, and the contract-age cut: a
        // symbol first seen after t1_end - t3 months is too young.
        let age_cutoff = time::subtract_months(&t1_end, config.t3_months)?;
        let age_probe = time::add_days(&age_cutoff, -1)?;
        let mut eligible = Vec::new();
        for symbol in candidates {
            if !self
                .exists_on(&symbol, &t1_start, opts, existence_cache)
                .await?
            {
                continue;
            }
            if !self
                .exists_on(&symbol, &age_probe, opts, existence_cache)
                .await?
            {
                debug!("{symbol}: listed after {age_cutoff}, excluded");
                continue;
            }
            eligible.push(symbol);
        }
        info!(
            "{} symbols eligible in {t1_start}..{t1_end}",
            eligible.len()
        );

        let mut turnover: Vec<(String, f64)> = Vec::new();
        for (i, symbol) in eligible.iter().enumerate() {
            match self
                .mean_daily_amount(symbol, &t1_start, &t1_end, opts)
                .await
            {
                Ok(Some(amount)) => turnover.push((symbol.clone(), amount)),
                Ok(None) => warn!("{symbol}: no turnover data in the window, skipped"),
                Err(e) => warn!("{symbol}: turnover fetch failed, skipped: {e}"),
            }
            if opts.batch_size > 0
                && (i + 1) % opts.batch_size == 0
                && i + 1 < eligible.len()
            {
                sleep(std::time::Duration::from_millis(opts.batch_delay_ms)).await;
            }
        }

        turnover.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let take = match (config.top_k, config.top_ratio) {
            (Some(k), _) => k,
            (_, Some(r)) => ((turnover.len() as f64) * r) as usize,
            _ => turnover.len(),
        };
        let selected: Vec<(String, f64)> = turnover.into_iter().take(take).collect();

        let symbols: Vec<String> = selected.iter().map(|(s, _)| s.clone()).collect();
        let amounts: BTreeMap<String, f64> = selected.into_iter().collect();
        let metadata = BTreeMap::from([
            ("delay_days".to_string(), json!(config.delay_days)),
            ("quote_asset".to_string(), json!(config.quote_asset)),
            ("selected_symbols_count".to_string(), json!(symbols.len())),
        ]);

        UniverseSnapshot::for_rebalance(
            rebalance_date,
            plan_end_date,
            config.t1_months,
            config.delay_days,
            symbols,
            amounts,
            metadata,
        )
    }

    /// Whether the symbol has any daily bar on `date`.
    async fn exists_on(
        &self,
        symbol: &str,
        date: &str,
        opts: &PlannerOptions,
        cache: &mut HashMap<(String, String), bool>,
    ) -> Result<bool> {
        let key = (symbol.to_string(), date.to_string());
        if let Some(known) = cache.get(&key) {
            return Ok(*known);
        }
        let start_ms = time::date_to_ts_start(date)?;
        let end_ms = time::date_to_ts_end(date, Freq::D1)?;
        let rows = fetch_with_policy(
            &format!("exists:{symbol}:{date}"),
            &self.limiters.batch,
            opts.retry,
            || {
                self.client.get_historical_klines(
                    symbol,
                    Freq::D1.as_str(),
                    start_ms,
                    end_ms,
                    1,
                    Market::Futures,
                )
            },
        )
        .await;
        let exists = match rows {
            Ok(rows) => !rows.is_empty(),
            Err(ClientError::InvalidSymbol(_)) => false,
            Err(e) => return Err(anyhow::anyhow!("existence check failed for {symbol}: {e}")),
        };
        cache.insert(key, exists);
        Ok(exists)
    }

    /// Mean daily quote volume over `[t1_start, t1_end]`, `None` if the
    /// symbol has no usable bars. Incomplete coverage (<80%) is warned, not
    /// disqualifying.
    async fn mean_daily_amount(
        &self,
        symbol: &str,
        t1_start: &str,
        t1_end: &str,
        opts: &PlannerOptions,
    ) -> Result<Option<f64>> {
        let start_ms = time::date_to_ts_start(t1_start)?;
        let end_ms = time::date_to_ts_end(t1_end, Freq::D1)?;
        let rows = fetch_with_policy(
            &format!("turnover:{symbol}"),
            &self.limiters.batch,
            opts.retry,
            || {
                self.client.get_historical_klines(
                    symbol,
                    Freq::D1.as_str(),
                    start_ms,
                    end_ms,
                    1500,
                    Market::Futures,
                )
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("turnover fetch failed for {symbol}: {e}"))?;

        if rows.is_empty() {
            return Ok(None);
        }
        let expected_days = time::expected_points(end_ms - start_ms + 1, Freq::D1)?;
        if (rows.len() as f64) < expected_days as f64 * 0.8 {
            warn!(
                "{symbol}: incomplete lookback coverage ({}/{} days)",
                rows.len(),
                expected_days
            );
        }

        let amounts: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(7).and_then(value_f64))
            .collect();
        if amounts.is_empty() {
            return Ok(None);
        }
        Ok(Some(amounts.iter().sum::<f64>() / amounts.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockExchange, SymbolScript};

    fn config(top_k: Option<usize>, top_ratio: Option<f64>) -> UniverseConfig {
        UniverseConfig {
            start_date: "2024-03-01".into(),
            end_date: "2024-04-01".into(),
            t1_months: 1,
            t2_months: 1,
            t3_months: 3,
            delay_days: 7,
            quote_asset: "USDT".into(),
            top_k,
            top_ratio,
        }
    }

    fn planner_opts() -> PlannerOptions {
        PlannerOptions {
            retry: RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 1.0,
                jitter: false,
            },
            batch_size: 0,
            batch_delay_ms: 0,
        }
    }

    fn seeded_mock() -> Arc<MockExchange> {
        let mock = Arc::new(MockExchange::default());
        mock.set_perpetual_symbols(vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "NEWUSDT".into(),
            "XRPBUSD".into(),
        ]);
        // Long histories with distinct turnovers.
        mock.script(
            "BTCUSDT",
            SymbolScript::rows(MockExchange::daily_rows("2023-01-01", "2024-04-01", 5.0e9)),
        );
        mock.script(
            "ETHUSDT",
            SymbolScript::rows(MockExchange::daily_rows("2023-01-01", "2024-04-01", 2.0e9)),
        );
        // Listed two weeks before the first rebalance: fails the t3 cut.
        mock.script(
            "NEWUSDT",
            SymbolScript::rows(MockExchange::daily_rows("2024-02-15", "2024-04-01", 9.0e9)),
        );
        mock
    }

    #[tokio::test]
    async fn plans_select_top_k_by_turnover() {
        let mock = seeded_mock();
        let planner = UniversePlanner::new(mock, Arc::new(EndpointLimiters::unthrottled()));
        let dir = tempfile::tempdir().unwrap();

        let (definition, path) = planner
            .define_universe(&config(Some(1), None), dir.path(), None, &planner_opts())
            .await
            .unwrap();

        // 2024-03-01 plans; the 2024-04-01 rebalance has an empty usage
        // window (it falls on the plan's last day) and is skipped.
        assert_eq!(definition.snapshots.len(), 1);
        for snapshot in &definition.snapshots {
            // The young contract is excluded and BTC out-ranks ETH.
            assert_eq!(snapshot.symbols, vec!["BTCUSDT".to_string()]);
            assert!((snapshot.mean_daily_amounts["BTCUSDT"] - 5.0e9).abs() < 1.0);
            snapshot.validate().unwrap();
        }
        assert!(path.exists());
        let loaded = UniverseDefinition::load_from_file(&path).unwrap();
        assert_eq!(loaded.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn top_ratio_takes_a_floor_fraction() {
        let mock = seeded_mock();
        let planner = UniversePlanner::new(mock, Arc::new(EndpointLimiters::unthrottled()));
        let dir = tempfile::tempdir().unwrap();

        let (definition, _) = planner
            .define_universe(
                &config(None, Some(0.5)),
                &dir.path().join("u.json"),
                None,
                &planner_opts(),
            )
            .await
            .unwrap();
        // Two eligible symbols, ratio 0.5 -> one selected.
        assert_eq!(definition.snapshots[0].symbols.len(), 1);
    }

    #[tokio::test]
    async fn quote_asset_filter_applies_before_eligibility() {
        let mock = seeded_mock();
        // Even with a rich history, a BUSD-quoted contract is not a
        // candidate for a USDT universe.
        mock.script(
            "XRPBUSD",
            SymbolScript::rows(MockExchange::daily_rows("2023-01-01", "2024-04-01", 8.0e9)),
        );
        let planner = UniversePlanner::new(mock, Arc::new(EndpointLimiters::unthrottled()));
        let dir = tempfile::tempdir().unwrap();

        let (definition, _) = planner
            .define_universe(
                &config(Some(10), None),
                &dir.path().join("u.json"),
                None,
                &planner_opts(),
            )
            .await
            .unwrap();
        for snapshot in &definition.snapshots {
            assert!(!snapshot.symbols.iter().any(|s| s.ends_with("BUSD")));
        }
    }

    #[tokio::test]
    async fn snapshots_satisfy_temporal_relations_over_random_configs() {
        // Property: for any plan the planner produces,
        // calculated_t1_end <= effective_date < start_date and consecutive
        // usage windows leave no gap.
        let mock = seeded_mock();
        let planner = UniversePlanner::new(mock, Arc::new(EndpointLimiters::unthrottled()));
        let dir = tempfile::tempdir().unwrap();

        for (t1, t2, delay) in [(1u32, 1u32, 7u32), (1, 1, 1), (2, 1, 10), (1, 2, 3)] {
            let cfg = UniverseConfig {
                t1_months: t1,
                t2_months: t2,
                delay_days: delay,
                ..config(Some(2), None)
            };
            let (definition, _) = planner
                .define_universe(
                    &cfg,
                    &dir.path().join(format!("u_{t1}_{t2}_{delay}.json")),
                    None,
                    &planner_opts(),
                )
                .await
                .unwrap();
            definition.validate().unwrap();
            for s in &definition.snapshots {
                assert!(s.calculated_t1_end <= s.effective_date);
                assert!(s.effective_date < s.start_date);
            }
        }
    }
}
