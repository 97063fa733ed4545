//! Binance-backed implementation of the exchange capability.
//!
//! Only public market-data endpoints are used; the API key header is sent
//! when configured because keyed requests get a larger rate-limit budget.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::client::{ClientError, ExchangeClient, Market};
use crate::models::{RatioType, RawKlineRow};

const SPOT_API_BASE: &str = "https://api.binance.com";
const FUTURES_API_BASE: &str = "https://fapi.binance.com";
const FUTURES_COIN_API_BASE: &str = "https://dapi.binance.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct BinanceClient {
    client: Client,
    api_key: Option<String>,
}

impl BinanceClient {
    pub fn new(api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("marketpipe/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, api_key }
    }

    async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value, ClientError> {
        debug!("GET {url} {params:?}");
        let mut request = self.client.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ClientError::Transient(e.to_string())
            } else {
                ClientError::Other(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ClientError::Other(format!("malformed response body: {e}")));
        }
        Err(classify_http_failure(status, &body))
    }
}

/// Map an HTTP failure to the typed signal the retry policy branches on.
/// Binance carries an application error code in the JSON body; -1121 is
/// "invalid symbol" and -1003 is "too many requests".
fn classify_http_failure(status: StatusCode, body: &str) -> ClientError {
    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(Value::as_i64));

    match (status, code) {
        (_, Some(-1121)) => ClientError::InvalidSymbol(body.to_string()),
        (StatusCode::TOO_MANY_REQUESTS, _) | (_, Some(-1003)) => {
            ClientError::RateLimited { retry_after: None }
        }
        (StatusCode::UNAUTHORIZED, _) | (StatusCode::FORBIDDEN, _) => {
            ClientError::Unauthorized(format!("{status}: {body}"))
        }
        (s, _) if s.is_server_error() => ClientError::Transient(format!("{s}: {body}")),
        (s, _) if s == StatusCode::BAD_REQUEST && body.contains("Invalid symbol") => {
            ClientError::InvalidSymbol(body.to_string())
        }
        (s, _) => ClientError::Other(format!("{s}: {body}")),
    }
}

fn rows_from(value: Value) -> Result<Vec<Value>, ClientError> {
    match value {
        Value::Array(rows) => Ok(rows),
        other => Err(ClientError::Other(format!(
            "expected an array response, got: {other}"
        ))),
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn list_perpetual_symbols(
        &self,
        only_trading: bool,
        quote_asset: &str,
    ) -> Result<Vec<String>, ClientError> {
        let url = format!("{FUTURES_API_BASE}/fapi/v1/exchangeInfo");
        let info = self.get_json(&url, &[]).await?;
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Other("exchangeInfo missing symbols".into()))?;

        let mut out = Vec::new();
        for entry in symbols {
            let contract = entry.get("contractType").and_then(Value::as_str);
            if contract != Some("PERPETUAL") {
                continue;
            }
            if only_trading && entry.get("status").and_then(Value::as_str) != Some("TRADING") {
                continue;
            }
            if entry.get("quoteAsset").and_then(Value::as_str) != Some(quote_asset) {
                continue;
            }
            if let Some(symbol) = entry.get("symbol").and_then(Value::as_str) {
                out.push(symbol.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
        market: Market,
    ) -> Result<Vec<RawKlineRow>, ClientError> {
        let url = match market {
            Market::Spot => format!("{SPOT_API_BASE}/api/v3/klines"),
            Market::Futures => format!("{FUTURES_API_BASE}/fapi/v1/klines"),
            Market::FuturesCoin => format!("{FUTURES_COIN_API_BASE}/dapi/v1/klines"),
        };

        // The provider caps one page at 1500 rows; page forward until the
        // window is exhausted.
        let mut all_rows: Vec<RawKlineRow> = Vec::new();
        let mut cursor = start_ms;
        loop {
            let params = [
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", cursor.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", limit.min(1500).to_string()),
            ];
            let page = rows_from(self.get_json(&url, &params).await?)?;
            let page: Vec<RawKlineRow> = page
                .into_iter()
                .filter_map(|row| match row {
                    Value::Array(fields) => Some(fields),
                    _ => None,
                })
                .collect();

            let Some(last) = page.last() else { break };
            let last_open = last
                .first()
                .and_then(crate::models::value_i64)
                .ok_or_else(|| ClientError::Other("kline row missing open_time".into()))?;
            let page_len = page.len();
            all_rows.extend(page);

            if page_len < limit.min(1500) as usize || last_open >= end_ms {
                break;
            }
            cursor = last_open + 1;
        }
        Ok(all_rows)
    }

    async fn get_funding_rate(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let url = format!("{FUTURES_API_BASE}/fapi/v1/fundingRate");
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("limit", limit.min(1000).to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime", end.to_string()));
        }
        rows_from(self.get_json(&url, &params).await?)
    }

    async fn get_open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let url = format!("{FUTURES_API_BASE}/futures/data/openInterestHist");
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("period", period.to_string()),
            ("limit", limit.min(500).to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime", end.to_string()));
        }
        rows_from(self.get_json(&url, &params).await?)
    }

    async fn get_long_short_ratio(
        &self,
        symbol: &str,
        period: &str,
        ratio_type: RatioType,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let endpoint = match ratio_type {
            RatioType::ToptraderAccount => "topLongShortAccountRatio",
            RatioType::ToptraderPosition => "topLongShortPositionRatio",
            RatioType::GlobalAccount => "globalLongShortAccountRatio",
            RatioType::TakerVol => "takerlongshortRatio",
        };
        let url = format!("{FUTURES_API_BASE}/futures/data/{endpoint}");
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("period", period.to_string()),
            ("limit", limit.min(500).to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime", end.to_string()));
        }
        rows_from(self.get_json(&url, &params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_symbol_code() {
        let err = classify_http_failure(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        assert!(err.is_invalid_symbol());
    }

    #[test]
    fn classifies_rate_limit_status_and_code() {
        assert!(classify_http_failure(StatusCode::TOO_MANY_REQUESTS, "{}").is_rate_limited());
        let err = classify_http_failure(
            StatusCode::IM_A_TEAPOT,
            r#"{"code":-1003,"msg":"Too many requests."}"#,
        );
        assert!(err.is_rate_limited());
    }

    #[test]
    fn classifies_auth_and_server_errors() {
        assert!(classify_http_failure(StatusCode::UNAUTHORIZED, "{}").is_unauthorized());
        assert!(classify_http_failure(StatusCode::FORBIDDEN, "{}").is_unauthorized());
        assert!(matches!(
            classify_http_failure(StatusCode::BAD_GATEWAY, "{}"),
            ClientError::Transient(_)
        ));
    }
}
