//! Batch writes and bookkeeping reads.
//!
//! All writes are upserts on the table's primary key, so re-downloading a
//! window is a no-op and concurrent workers writing the same rows are safe.
//! Chunks of 1000 rows commit in a single `BEGIN IMMEDIATE` transaction.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::params;
use tracing::{debug, warn};

use crate::models::{Freq, FundingRate, LongShortRatio, OpenInterest, PerpKline};
use crate::storage::ConnectionPool;
use crate::time;

const BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct TableSummary {
    pub rows: i64,
    pub symbols: i64,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSummary {
    pub market_data: TableSummary,
    pub funding_rate: TableSummary,
    pub open_interest: TableSummary,
    pub long_short_ratio: TableSummary,
}

/// Handle to the market database. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct MarketStore {
    pool: ConnectionPool,
}

impl MarketStore {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self> {
        Ok(Self {
            pool: ConnectionPool::open(path, pool_size)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: ConnectionPool::in_memory()?,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Upsert K-line rows at `freq`. Returns the number of rows written.
    pub async fn insert_klines(&self, rows: &[PerpKline], freq: Freq) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for chunk in rows.chunks(BATCH_SIZE) {
            let conn = self.pool.acquire().await;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<usize> {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO market_data (
                        symbol, timestamp, freq,
                        open_price, high_price, low_price, close_price,
                        volume, quote_volume, trades_count,
                        taker_buy_volume, taker_buy_quote_volume,
                        taker_sell_volume, taker_sell_quote_volume,
                        close_time
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                let mut ok = 0usize;
                for k in chunk {
                    let outcome = stmt.execute(params![
                        k.symbol,
                        k.open_time,
                        freq.as_str(),
                        k.open,
                        k.high,
                        k.low,
                        k.close,
                        k.volume,
                        k.quote_volume,
                        k.trades_count,
                        k.taker_buy_volume,
                        k.taker_buy_quote_volume,
                        k.taker_sell_volume(),
                        k.taker_sell_quote_volume(),
                        k.close_time,
                    ]);
                    match outcome {
                        Ok(_) => ok += 1,
                        // Validation strips bad rows upstream; a stray
                        // failure drops the row, the chunk still commits.
                        Err(e) => warn!("dropping kline row {} @ {}: {e}", k.symbol, k.open_time),
                    }
                }
                Ok(ok)
            })();
            match result {
                Ok(ok) => {
                    conn.execute_batch("COMMIT")?;
                    written += ok;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e).context("kline batch insert failed");
                }
            }
        }
        debug!("stored {written} kline rows ({freq})");
        Ok(written)
    }

    pub async fn insert_funding_rates(&self, rows: &[FundingRate]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for chunk in rows.chunks(BATCH_SIZE) {
            let conn = self.pool.acquire().await;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<usize> {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO funding_rate (
                        symbol, timestamp, funding_rate, funding_time, mark_price, index_price
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for fr in chunk {
                    stmt.execute(params![
                        fr.symbol,
                        fr.funding_time,
                        fr.funding_rate,
                        fr.funding_time,
                        fr.mark_price,
                        fr.index_price,
                    ])?;
                }
                Ok(chunk.len())
            })();
            match result {
                Ok(ok) => {
                    conn.execute_batch("COMMIT")?;
                    written += ok;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e).context("funding rate batch insert failed");
                }
            }
        }
        debug!("stored {written} funding rate rows");
        Ok(written)
    }

    pub async fn insert_open_interest(&self, rows: &[OpenInterest]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for chunk in rows.chunks(BATCH_SIZE) {
            let conn = self.pool.acquire().await;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<usize> {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO open_interest (
                        symbol, timestamp, interval, open_interest, open_interest_value
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for oi in chunk {
                    stmt.execute(params![
                        oi.symbol,
                        oi.timestamp,
                        oi.interval,
                        oi.open_interest,
                        oi.open_interest_value,
                    ])?;
                }
                Ok(chunk.len())
            })();
            match result {
                Ok(ok) => {
                    conn.execute_batch("COMMIT")?;
                    written += ok;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e).context("open interest batch insert failed");
                }
            }
        }
        debug!("stored {written} open interest rows");
        Ok(written)
    }

    pub async fn insert_long_short_ratios(&self, rows: &[LongShortRatio]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for chunk in rows.chunks(BATCH_SIZE) {
            let conn = self.pool.acquire().await;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<usize> {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO long_short_ratio (
                        symbol, timestamp, period, ratio_type,
                        long_short_ratio, long_account, short_account
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for lsr in chunk {
                    stmt.execute(params![
                        lsr.symbol,
                        lsr.timestamp,
                        lsr.period,
                        lsr.ratio_type.as_str(),
                        lsr.long_short_ratio,
                        lsr.long_account,
                        lsr.short_account,
                    ])?;
                }
                Ok(chunk.len())
            })();
            match result {
                Ok(ok) => {
                    conn.execute_batch("COMMIT")?;
                    written += ok;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e).context("long/short ratio batch insert failed");
                }
            }
        }
        debug!("stored {written} long/short ratio rows");
        Ok(written)
    }

    /// Stored bar count for one symbol over a date window.
    pub async fn count_klines(
        &self,
        symbol: &str,
        start_date: &str,
        end_date: &str,
        freq: Freq,
    ) -> Result<i64> {
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, freq)?;
        let conn = self.pool.acquire().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM market_data
             WHERE symbol = ?1 AND freq = ?2 AND timestamp BETWEEN ?3 AND ?4",
            params![symbol, freq.as_str(), start_ms, end_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Row counts and time spans per table.
    pub async fn data_summary(&self) -> Result<DataSummary> {
        let conn = self.pool.acquire().await;
        let table = |name: &str| -> Result<TableSummary> {
            let sql = format!(
                "SELECT COUNT(*), COUNT(DISTINCT symbol), MIN(timestamp), MAX(timestamp) FROM {name}"
            );
            let summary = conn.query_row(&sql, [], |row| {
                Ok(TableSummary {
                    rows: row.get(0)?,
                    symbols: row.get(1)?,
                    min_timestamp: row.get(2)?,
                    max_timestamp: row.get(3)?,
                })
            })?;
            Ok(summary)
        };
        Ok(DataSummary {
            market_data: table("market_data")?,
            funding_rate: table("funding_rate")?,
            open_interest: table("open_interest")?,
            long_short_ratio: table("long_short_ratio")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn kline(symbol: &str, open_time: i64, close: f64) -> PerpKline {
        PerpKline {
            symbol: symbol.to_string(),
            open_time,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            quote_volume: 1000.0,
            trades_count: 42,
            taker_buy_volume: 6.0,
            taker_buy_quote_volume: 600.0,
            close_time: open_time + 3_599_999,
        }
    }

    #[tokio::test]
    async fn duplicate_write_is_idempotent() {
        let store = MarketStore::in_memory().unwrap();
        let rows: Vec<PerpKline> = (0..24)
            .map(|i| kline("BTCUSDT", 1_704_067_200_000 + i * 3_600_000, 100.0 + i as f64))
            .collect();

        store.insert_klines(&rows, Freq::H1).await.unwrap();
        let first = store
            .count_klines("BTCUSDT", "2024-01-01", "2024-01-01", Freq::H1)
            .await
            .unwrap();
        store.insert_klines(&rows, Freq::H1).await.unwrap();
        let second = store
            .count_klines("BTCUSDT", "2024-01-01", "2024-01-01", Freq::H1)
            .await
            .unwrap();

        assert_eq!(first, 24);
        assert_eq!(second, 24);
    }

    #[tokio::test]
    async fn upsert_keeps_latest_values() {
        let store = MarketStore::in_memory().unwrap();
        let ts = 1_704_067_200_000;
        store
            .insert_klines(&[kline("BTCUSDT", ts, 100.0)], Freq::H1)
            .await
            .unwrap();
        store
            .insert_klines(&[kline("BTCUSDT", ts, 200.0)], Freq::H1)
            .await
            .unwrap();

        let conn = store.pool().acquire().await;
        let close: f64 = conn
            .query_row(
                "SELECT close_price FROM market_data WHERE symbol='BTCUSDT' AND timestamp=?1",
                [ts],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(close, 200.0);
    }

    #[tokio::test]
    async fn taker_sell_columns_are_derived_at_write() {
        let store = MarketStore::in_memory().unwrap();
        store
            .insert_klines(&[kline("BTCUSDT", 0, 100.0)], Freq::H1)
            .await
            .unwrap();
        let conn = store.pool().acquire().await;
        let (sell_vol, sell_amt): (f64, f64) = conn
            .query_row(
                "SELECT taker_sell_volume, taker_sell_quote_volume FROM market_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((sell_vol - 4.0).abs() < 1e-9);
        assert!((sell_amt - 400.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metric_tables_upsert_on_their_keys() {
        let store = MarketStore::in_memory().unwrap();
        let fr = FundingRate {
            symbol: "BTCUSDT".into(),
            funding_time: 1000,
            funding_rate: 0.0001,
            mark_price: None,
            index_price: None,
        };
        store.insert_funding_rates(&[fr.clone()]).await.unwrap();
        let mut updated = fr.clone();
        updated.funding_rate = 0.0002;
        store.insert_funding_rates(&[updated]).await.unwrap();

        let conn = store.pool().acquire().await;
        let (count, rate): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(funding_rate) FROM funding_rate",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!((rate - 0.0002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn summary_reports_spans() {
        let store = MarketStore::in_memory().unwrap();
        store
            .insert_klines(
                &[kline("BTCUSDT", 1000, 1.0), kline("ETHUSDT", 5000, 2.0)],
                Freq::H1,
            )
            .await
            .unwrap();
        let summary = store.data_summary().await.unwrap();
        assert_eq!(summary.market_data.rows, 2);
        assert_eq!(summary.market_data.symbols, 2);
        assert_eq!(summary.market_data.min_timestamp, Some(1000));
        assert_eq!(summary.market_data.max_timestamp, Some(5000));
        assert_eq!(summary.funding_rate.rows, 0);
    }
}
