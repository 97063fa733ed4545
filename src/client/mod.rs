//! Exchange client capability.
//!
//! The ingestor and planner consume the [`ExchangeClient`] trait; the
//! production implementation is [`BinanceClient`]. Tests script their own
//! implementations.

mod binance;
pub mod mock;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

pub use binance::BinanceClient;

use crate::models::RawKlineRow;

/// Which market a K-line request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Spot,
    Futures,
    FuturesCoin,
}

/// Failure signals the ingestor needs to distinguish. Everything the retry
/// policy branches on is a variant here; provider-specific detail stays in
/// the message strings.
#[derive(Debug)]
pub enum ClientError {
    /// The symbol does not exist on the requested market. Final.
    InvalidSymbol(String),
    /// Provider throttling (HTTP 429 / code -1003). Retry after widening.
    RateLimited { retry_after: Option<u64> },
    /// Connectivity trouble or a 5xx; worth retrying with backoff.
    Transient(String),
    /// Bad or missing credentials (401/403). Abort the run.
    Unauthorized(String),
    /// Anything else.
    Other(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSymbol(sym) => write!(f, "invalid symbol: {sym}"),
            Self::RateLimited { retry_after } => match retry_after {
                Some(secs) => write!(f, "rate limited (retry after {secs}s)"),
                None => write!(f, "rate limited"),
            },
            Self::Transient(msg) => write!(f, "transient error: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    pub fn is_invalid_symbol(&self) -> bool {
        matches!(self, Self::InvalidSymbol(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Typed operations the pipeline needs from a market-data provider.
///
/// All timestamps are UTC milliseconds. Raw rows are returned as loosely
/// typed JSON; parsing into domain records happens in `models`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Perpetual symbols quoted in `quote_asset`, optionally only those
    /// currently trading.
    async fn list_perpetual_symbols(
        &self,
        only_trading: bool,
        quote_asset: &str,
    ) -> Result<Vec<String>, ClientError>;

    /// Historical K-lines as positional rows.
    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
        market: Market,
    ) -> Result<Vec<RawKlineRow>, ClientError>;

    /// Funding-rate history objects.
    async fn get_funding_rate(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError>;

    /// Open-interest history objects. Provider caps `limit` at 500.
    async fn get_open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError>;

    /// Long/short ratio objects for one ratio endpoint.
    /// Provider caps `limit` at 500 and the window at the last 30 days.
    async fn get_long_short_ratio(
        &self,
        symbol: &str,
        period: &str,
        ratio_type: crate::models::RatioType,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError>;
}
