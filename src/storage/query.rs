//! Typed reads producing `(symbol, timestamp)`-indexed frames.
//!
//! Results are sorted ascending by `(symbol, timestamp)`; missing rows are
//! simply absent. Numeric columns come back as `f64` (integers widened,
//! SQL NULL as NaN).

use anyhow::{bail, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use tracing::debug;

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::models::{Freq, RatioType};
use crate::storage::MarketStore;
use crate::time;

/// Default K-line feature columns, in storage order. `close_time` is
/// queryable but not part of the default set.
pub const KLINE_FEATURES: [&str; 11] = [
    "open_price",
    "high_price",
    "low_price",
    "close_price",
    "volume",
    "quote_volume",
    "trades_count",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "taker_sell_volume",
    "taker_sell_quote_volume",
];

const KLINE_COLUMNS: [&str; 12] = [
    "open_price",
    "high_price",
    "low_price",
    "close_price",
    "volume",
    "quote_volume",
    "trades_count",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "taker_sell_volume",
    "taker_sell_quote_volume",
    "close_time",
];

const FUNDING_COLUMNS: [&str; 3] = ["funding_rate", "mark_price", "index_price"];
const OI_COLUMNS: [&str; 2] = ["open_interest", "open_interest_value"];

fn check_columns(requested: &[&str], allowed: &[&str]) -> Result<()> {
    for col in requested {
        if !allowed.contains(col) {
            bail!(PipelineError::InvalidInput(format!("unknown column: {col}")));
        }
    }
    Ok(())
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

impl MarketStore {
    /// K-line rows for `symbols` over `[start_date, end_date]` at `freq`.
    ///
    /// With `strict`, an empty result is a `NoData` error instead of an
    /// empty frame.
    pub async fn select_klines(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        freq: Freq,
        columns: Option<&[&str]>,
        strict: bool,
    ) -> Result<Frame> {
        let features: Vec<&str> = match columns {
            Some(cols) => {
                check_columns(cols, &KLINE_COLUMNS)?;
                cols.to_vec()
            }
            None => KLINE_FEATURES.to_vec(),
        };
        if symbols.is_empty() {
            return empty_or_strict(features, strict, "no symbols requested");
        }

        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, freq)?;
        let sql = format!(
            "SELECT symbol, timestamp, {} FROM market_data
             WHERE timestamp BETWEEN ?1 AND ?2 AND freq = ?3 AND symbol IN ({})
             ORDER BY symbol, timestamp",
            features.join(", "),
            placeholders(symbols.len()),
        );
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Integer(start_ms),
            SqlValue::Integer(end_ms),
            SqlValue::Text(freq.as_str().to_string()),
        ];
        params.extend(symbols.iter().map(|s| SqlValue::Text(s.clone())));

        let frame = self.fetch_frame(&sql, params, &features).await?;
        debug!(
            "select_klines: {} rows, {} symbols ({start_date}..{end_date} @ {freq})",
            frame.len(),
            frame.symbols().len()
        );
        if strict && frame.is_empty() {
            bail!(PipelineError::NoData(format!(
                "no {freq} kline rows in {start_date}..{end_date}"
            )));
        }
        Ok(frame)
    }

    /// Funding-rate rows, default column `funding_rate`.
    pub async fn select_funding_rates(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        columns: Option<&[&str]>,
    ) -> Result<Frame> {
        let features: Vec<&str> = match columns {
            Some(cols) => {
                check_columns(cols, &FUNDING_COLUMNS)?;
                cols.to_vec()
            }
            None => vec!["funding_rate"],
        };
        if symbols.is_empty() {
            return Ok(Frame::empty(features.iter().map(|c| c.to_string()).collect()));
        }
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, Freq::D1)?;
        let sql = format!(
            "SELECT symbol, timestamp, {} FROM funding_rate
             WHERE timestamp BETWEEN ?1 AND ?2 AND symbol IN ({})
             ORDER BY symbol, timestamp",
            features.join(", "),
            placeholders(symbols.len()),
        );
        let mut params: Vec<SqlValue> =
            vec![SqlValue::Integer(start_ms), SqlValue::Integer(end_ms)];
        params.extend(symbols.iter().map(|s| SqlValue::Text(s.clone())));
        self.fetch_frame(&sql, params, &features).await
    }

    /// Open-interest rows, default columns `open_interest`,
    /// `open_interest_value`.
    pub async fn select_open_interest(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        columns: Option<&[&str]>,
    ) -> Result<Frame> {
        let features: Vec<&str> = match columns {
            Some(cols) => {
                check_columns(cols, &OI_COLUMNS)?;
                cols.to_vec()
            }
            None => OI_COLUMNS.to_vec(),
        };
        if symbols.is_empty() {
            return Ok(Frame::empty(features.iter().map(|c| c.to_string()).collect()));
        }
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, Freq::D1)?;
        let sql = format!(
            "SELECT symbol, timestamp, {} FROM open_interest
             WHERE timestamp BETWEEN ?1 AND ?2 AND symbol IN ({})
             ORDER BY symbol, timestamp",
            features.join(", "),
            placeholders(symbols.len()),
        );
        let mut params: Vec<SqlValue> =
            vec![SqlValue::Integer(start_ms), SqlValue::Integer(end_ms)];
        params.extend(symbols.iter().map(|s| SqlValue::Text(s.clone())));
        self.fetch_frame(&sql, params, &features).await
    }

    /// Long/short ratio rows for one ratio type. With
    /// `rename_to_export_name` the ratio column is named `lsr_ta` /
    /// `lsr_tp` / `lsr_ga` / `lsr_tv` instead of `long_short_ratio`.
    pub async fn select_long_short_ratio_by_type(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        ratio_type: RatioType,
        rename_to_export_name: bool,
    ) -> Result<Frame> {
        let out_name = if rename_to_export_name {
            ratio_type.export_name()
        } else {
            "long_short_ratio"
        };
        if symbols.is_empty() {
            return Ok(Frame::empty(vec![out_name.to_string()]));
        }
        let (start_ms, end_ms) = time::date_range_ms(start_date, end_date, Freq::D1)?;
        let sql = format!(
            "SELECT symbol, timestamp, long_short_ratio FROM long_short_ratio
             WHERE timestamp BETWEEN ?1 AND ?2 AND ratio_type = ?3 AND symbol IN ({})
             ORDER BY symbol, timestamp",
            placeholders(symbols.len()),
        );
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Integer(start_ms),
            SqlValue::Integer(end_ms),
            SqlValue::Text(ratio_type.as_str().to_string()),
        ];
        params.extend(symbols.iter().map(|s| SqlValue::Text(s.clone())));
        self.fetch_frame(&sql, params, &[out_name]).await
    }

    async fn fetch_frame(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        features: &[&str],
    ) -> Result<Frame> {
        let conn = self.pool().acquire().await;
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;

        let mut out: Vec<(String, i64, Vec<f64>)> = Vec::new();
        while let Some(row) = rows.next()? {
            let symbol: String = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let mut cells = Vec::with_capacity(features.len());
            for i in 0..features.len() {
                let value: Option<f64> = row.get(2 + i)?;
                cells.push(value.unwrap_or(f64::NAN));
            }
            out.push((symbol, ts, cells));
        }
        Frame::from_rows(features.iter().map(|c| c.to_string()).collect(), out)
    }
}

fn empty_or_strict(features: Vec<&str>, strict: bool, reason: &str) -> Result<Frame> {
    if strict {
        bail!(PipelineError::NoData(reason.to_string()));
    }
    Ok(Frame::empty(features.iter().map(|c| c.to_string()).collect()))
}
