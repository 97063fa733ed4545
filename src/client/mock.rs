//! Scripted in-memory exchange for tests.
//!
//! Each symbol carries a script: a canned row set (filtered by the request
//! window), a failure mode, or a flaky sequence that fails N times before
//! succeeding. Call counts are recorded so tests can assert on request
//! behaviour (skip rules, retry budgets, window clamping).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::client::{ClientError, ExchangeClient, Market};
use crate::models::{value_i64, RatioType, RawKlineRow};
use crate::time;

enum Behavior {
    Rows(Vec<RawKlineRow>),
    InvalidSymbol,
    Unauthorized,
    AlwaysTransient,
    Flaky {
        remaining_failures: u32,
        rows: Vec<RawKlineRow>,
    },
}

pub struct SymbolScript {
    behavior: Behavior,
}

impl SymbolScript {
    pub fn rows(rows: Vec<RawKlineRow>) -> Self {
        Self {
            behavior: Behavior::Rows(rows),
        }
    }

    pub fn invalid_symbol() -> Self {
        Self {
            behavior: Behavior::InvalidSymbol,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            behavior: Behavior::Unauthorized,
        }
    }

    pub fn always_transient() -> Self {
        Self {
            behavior: Behavior::AlwaysTransient,
        }
    }

    /// Fail with a transient error `failures` times, then serve `rows`.
    pub fn flaky(failures: u32, rows: Vec<RawKlineRow>) -> Self {
        Self {
            behavior: Behavior::Flaky {
                remaining_failures: failures,
                rows,
            },
        }
    }
}

/// A recorded ratio request, for asserting on window clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioRequest {
    pub symbol: String,
    pub ratio_type: RatioType,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

#[derive(Default)]
pub struct MockExchange {
    perpetual_symbols: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, SymbolScript>>,
    funding: Mutex<HashMap<String, Vec<Value>>>,
    open_interest: Mutex<HashMap<String, Vec<Value>>>,
    ratios: Mutex<HashMap<(String, RatioType), Vec<Value>>>,
    kline_calls: AtomicUsize,
    ratio_requests: Mutex<Vec<RatioRequest>>,
}

impl MockExchange {
    /// A mock serving one symbol with 24 valid hourly bars on `date`.
    pub fn with_hourly_day(symbol: &str, date: &str) -> Self {
        let mock = Self::default();
        mock.script(symbol, SymbolScript::rows(Self::hourly_rows(date)));
        mock
    }

    pub fn script(&self, symbol: &str, script: SymbolScript) {
        self.scripts.lock().insert(symbol.to_string(), script);
    }

    pub fn set_perpetual_symbols(&self, symbols: Vec<String>) {
        *self.perpetual_symbols.lock() = symbols;
    }

    pub fn set_funding(&self, symbol: &str, rows: Vec<Value>) {
        self.funding.lock().insert(symbol.to_string(), rows);
    }

    pub fn set_open_interest(&self, symbol: &str, rows: Vec<Value>) {
        self.open_interest.lock().insert(symbol.to_string(), rows);
    }

    pub fn set_ratio(&self, symbol: &str, ratio_type: RatioType, rows: Vec<Value>) {
        self.ratios
            .lock()
            .insert((symbol.to_string(), ratio_type), rows);
    }

    pub fn kline_calls(&self) -> usize {
        self.kline_calls.load(Ordering::SeqCst)
    }

    pub fn ratio_requests(&self) -> Vec<RatioRequest> {
        self.ratio_requests.lock().clone()
    }

    /// 24 valid hourly rows for one UTC day.
    pub fn hourly_rows(date: &str) -> Vec<RawKlineRow> {
        Self::hourly_rows_with_base(date, 100.0)
    }

    pub fn hourly_rows_with_base(date: &str, base_price: f64) -> Vec<RawKlineRow> {
        let day_start = time::date_to_ts_start(date).expect("valid date");
        (0..24)
            .map(|i| {
                let open_time = day_start + i * 3_600_000;
                let price = base_price + i as f64;
                Self::kline_row(open_time, 3_600_000, price, 1000.0)
            })
            .collect()
    }

    /// Daily rows spanning `[start_date, end_date]`, with a fixed quote
    /// volume. Useful for scripting turnover histories.
    pub fn daily_rows(start_date: &str, end_date: &str, quote_volume: f64) -> Vec<RawKlineRow> {
        let start = time::date_to_ts_start(start_date).expect("valid date");
        let end = time::date_to_ts_start(end_date).expect("valid date");
        let mut rows = Vec::new();
        let mut ts = start;
        while ts <= end {
            rows.push(Self::kline_row(ts, 86_400_000, 50.0, quote_volume));
            ts += 86_400_000;
        }
        rows
    }

    pub fn kline_row(open_time: i64, stride_ms: i64, price: f64, quote_volume: f64) -> RawKlineRow {
        vec![
            json!(open_time),
            json!(format!("{price}")),
            json!(format!("{}", price + 2.0)),
            json!(format!("{}", price - 2.0)),
            json!(format!("{}", price + 1.0)),
            json!("10.0"),
            json!(open_time + stride_ms - 1),
            json!(format!("{quote_volume}")),
            json!(12),
            json!("6.0"),
            json!(format!("{}", quote_volume * 0.6)),
            json!("0"),
        ]
    }

    fn filter_window(rows: &[Value], start_ms: Option<i64>, end_ms: Option<i64>) -> Vec<Value> {
        rows.iter()
            .filter(|row| {
                let ts = row
                    .get("timestamp")
                    .or_else(|| row.get("fundingTime"))
                    .and_then(value_i64);
                match ts {
                    Some(ts) => {
                        start_ms.map_or(true, |s| ts >= s) && end_ms.map_or(true, |e| ts <= e)
                    }
                    None => true,
                }
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn list_perpetual_symbols(
        &self,
        _only_trading: bool,
        quote_asset: &str,
    ) -> Result<Vec<String>, ClientError> {
        Ok(self
            .perpetual_symbols
            .lock()
            .iter()
            .filter(|s| s.ends_with(quote_asset))
            .cloned()
            .collect())
    }

    async fn get_historical_klines(
        &self,
        symbol: &str,
        _interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
        _market: Market,
    ) -> Result<Vec<RawKlineRow>, ClientError> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(symbol) else {
            return Ok(Vec::new());
        };
        match &mut script.behavior {
            Behavior::InvalidSymbol => Err(ClientError::InvalidSymbol(symbol.to_string())),
            Behavior::Unauthorized => Err(ClientError::Unauthorized("bad credentials".into())),
            Behavior::AlwaysTransient => Err(ClientError::Transient("connection reset".into())),
            Behavior::Flaky {
                remaining_failures,
                rows,
            } => {
                if *remaining_failures > 0 {
                    *remaining_failures -= 1;
                    Err(ClientError::Transient("flaky".into()))
                } else {
                    Ok(window(rows, start_ms, end_ms, limit))
                }
            }
            Behavior::Rows(rows) => Ok(window(rows, start_ms, end_ms, limit)),
        }
    }

    async fn get_funding_rate(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        _limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let funding = self.funding.lock();
        Ok(Self::filter_window(
            funding.get(symbol).map(Vec::as_slice).unwrap_or(&[]),
            start_ms,
            end_ms,
        ))
    }

    async fn get_open_interest_hist(
        &self,
        symbol: &str,
        _period: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        _limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let oi = self.open_interest.lock();
        Ok(Self::filter_window(
            oi.get(symbol).map(Vec::as_slice).unwrap_or(&[]),
            start_ms,
            end_ms,
        ))
    }

    async fn get_long_short_ratio(
        &self,
        symbol: &str,
        _period: &str,
        ratio_type: RatioType,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        _limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        self.ratio_requests.lock().push(RatioRequest {
            symbol: symbol.to_string(),
            ratio_type,
            start_ms,
            end_ms,
        });
        let ratios = self.ratios.lock();
        Ok(Self::filter_window(
            ratios
                .get(&(symbol.to_string(), ratio_type))
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            start_ms,
            end_ms,
        ))
    }
}

fn window(rows: &[RawKlineRow], start_ms: i64, end_ms: i64, limit: u32) -> Vec<RawKlineRow> {
    rows.iter()
        .filter(|row| {
            row.first()
                .and_then(value_i64)
                .map(|ts| ts >= start_ms && ts <= end_ms)
                .unwrap_or(false)
        })
        .take(limit.max(1) as usize)
        .cloned()
        .collect()
}
