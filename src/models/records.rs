//! Parsed market-data records.
//!
//! Providers ship K-lines as positional JSON tuples with prices encoded as
//! strings; parsing happens once, at ingest, and the rest of the pipeline
//! works with plain `f64` values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw positional K-line row as returned by the provider:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trades_count, taker_buy_volume, taker_buy_quote_volume, ignore]`.
pub type RawKlineRow = Vec<Value>;

/// Numeric field that may arrive as a JSON number or a decimal string.
pub fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Integer field that may arrive as a JSON number or a string.
pub fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// One perpetual-futures bar, parsed and validated from a raw row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpKline {
    pub symbol: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub close_time: i64,
}

impl PerpKline {
    /// Parse a positional provider row. Fails on short rows or unparseable
    /// numeric fields; validation of price relations happens separately.
    pub fn from_raw(symbol: &str, row: &[Value]) -> Result<Self> {
        if row.len() < 11 {
            bail!("kline row has {} fields, expected at least 11", row.len());
        }
        let field = |idx: usize, name: &str| -> Result<f64> {
            value_f64(&row[idx]).with_context(|| format!("unparseable {name} in kline row"))
        };
        Ok(Self {
            symbol: symbol.to_string(),
            open_time: value_i64(&row[0]).context("unparseable open_time")?,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
            close_time: value_i64(&row[6]).context("unparseable close_time")?,
            quote_volume: field(7, "quote_volume")?,
            trades_count: value_i64(&row[8]).context("unparseable trades_count")?,
            taker_buy_volume: field(9, "taker_buy_volume")?,
            taker_buy_quote_volume: field(10, "taker_buy_quote_volume")?,
        })
    }

    pub fn taker_sell_volume(&self) -> f64 {
        self.volume - self.taker_buy_volume
    }

    pub fn taker_sell_quote_volume(&self) -> f64 {
        self.quote_volume - self.taker_buy_quote_volume
    }

    /// Price/volume sanity per the storage contract: non-negative prices,
    /// `high >= max(open, close, low)`, `low <= min(open, close, high)`,
    /// non-negative volume, and a non-empty symbol.
    pub fn is_valid(&self) -> bool {
        if self.symbol.is_empty() {
            return false;
        }
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return false;
        }
        if self.high < self.open.max(self.close).max(self.low) {
            return false;
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return false;
        }
        self.volume.is_finite() && self.volume >= 0.0
    }
}

/// A funding-rate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub funding_time: i64,
    pub funding_rate: f64,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
}

impl FundingRate {
    /// Parse a provider funding-rate object
    /// (`{symbol, fundingTime, fundingRate, markPrice?}`).
    pub fn from_provider(obj: &Value) -> Result<Self> {
        let symbol = obj
            .get("symbol")
            .and_then(Value::as_str)
            .context("funding rate row missing symbol")?;
        Ok(Self {
            symbol: symbol.to_string(),
            funding_time: obj
                .get("fundingTime")
                .and_then(value_i64)
                .context("funding rate row missing fundingTime")?,
            funding_rate: obj
                .get("fundingRate")
                .and_then(value_f64)
                .context("funding rate row missing fundingRate")?,
            mark_price: obj.get("markPrice").and_then(value_f64),
            index_price: obj.get("indexPrice").and_then(value_f64),
        })
    }
}

/// An open-interest sample at a given sampling interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub symbol: String,
    pub timestamp: i64,
    pub interval: String,
    pub open_interest: f64,
    pub open_interest_value: Option<f64>,
}

impl OpenInterest {
    /// Parse a provider open-interest-history object
    /// (`{symbol, sumOpenInterest, sumOpenInterestValue, timestamp}`).
    pub fn from_provider(obj: &Value, interval: &str) -> Result<Self> {
        let symbol = obj
            .get("symbol")
            .and_then(Value::as_str)
            .context("open interest row missing symbol")?;
        Ok(Self {
            symbol: symbol.to_string(),
            timestamp: obj
                .get("timestamp")
                .and_then(value_i64)
                .context("open interest row missing timestamp")?,
            interval: interval.to_string(),
            open_interest: obj
                .get("sumOpenInterest")
                .and_then(value_f64)
                .context("open interest row missing sumOpenInterest")?,
            open_interest_value: obj.get("sumOpenInterestValue").and_then(value_f64),
        })
    }
}

/// Which long/short ratio series a record belongs to. The four variants map
/// to four distinct provider endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioType {
    ToptraderAccount,
    ToptraderPosition,
    GlobalAccount,
    TakerVol,
}

impl RatioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatioType::ToptraderAccount => "toptrader_account",
            RatioType::ToptraderPosition => "toptrader_position",
            RatioType::GlobalAccount => "global_account",
            RatioType::TakerVol => "taker_vol",
        }
    }

    /// Short column/directory name used by the exporter.
    pub fn export_name(&self) -> &'static str {
        match self {
            RatioType::ToptraderAccount => "lsr_ta",
            RatioType::ToptraderPosition => "lsr_tp",
            RatioType::GlobalAccount => "lsr_ga",
            RatioType::TakerVol => "lsr_tv",
        }
    }

    /// Canonical ordering, also the stacking order in the timestamp cube.
    pub fn all() -> &'static [RatioType] {
        &[
            RatioType::ToptraderAccount,
            RatioType::ToptraderPosition,
            RatioType::GlobalAccount,
            RatioType::TakerVol,
        ]
    }

    pub fn parse(s: &str) -> Result<Self> {
        RatioType::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .with_context(|| format!("invalid ratio type: {s}"))
    }
}

impl std::fmt::Display for RatioType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long/short ratio sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongShortRatio {
    pub symbol: String,
    pub timestamp: i64,
    pub period: String,
    pub ratio_type: RatioType,
    pub long_short_ratio: f64,
    pub long_account: Option<f64>,
    pub short_account: Option<f64>,
}

impl LongShortRatio {
    /// Parse a provider ratio object. Account-based endpoints carry
    /// `longAccount`/`shortAccount`; the taker-volume endpoint carries
    /// `buyVol`/`sellVol` with the ratio under `buySellRatio`.
    pub fn from_provider(obj: &Value, period: &str, ratio_type: RatioType) -> Result<Self> {
        let symbol = obj
            .get("symbol")
            .and_then(Value::as_str)
            .context("long/short ratio row missing symbol")?;
        let timestamp = obj
            .get("timestamp")
            .and_then(value_i64)
            .context("long/short ratio row missing timestamp")?;
        let (ratio, long_side, short_side) = match ratio_type {
            RatioType::TakerVol => (
                obj.get("buySellRatio").and_then(value_f64),
                obj.get("buyVol").and_then(value_f64),
                obj.get("sellVol").and_then(value_f64),
            ),
            _ => (
                obj.get("longShortRatio").and_then(value_f64),
                obj.get("longAccount").and_then(value_f64),
                obj.get("shortAccount").and_then(value_f64),
            ),
        };
        Ok(Self {
            symbol: symbol.to_string(),
            timestamp,
            period: period.to_string(),
            ratio_type,
            long_short_ratio: ratio.context("long/short ratio row missing ratio value")?,
            long_account: long_side,
            short_account: short_side,
        })
    }
}
