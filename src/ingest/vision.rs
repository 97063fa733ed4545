//! Bulk-history metrics via daily ZIP archives.
//!
//! The ratio endpoints only serve the last 30 days; older open-interest and
//! long/short history is published as one ZIP per symbol per day containing
//! a metrics CSV. Rows are mapped onto the same storage tables as the API
//! path. CSV fields are comma-separated without quoting; columns are
//! resolved by header name.

use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::ingest::fetch_with_policy;
use crate::models::{IntegrityReport, LongShortRatio, MissingPeriod, OpenInterest, RatioType};
use crate::storage::MarketStore;
use crate::throttle::{EndpointLimiters, RetryConfig};
use crate::time;

const VISION_BASE_URL: &str =
    "https://s3-ap-northeast-1.amazonaws.com/data.binance.vision/data/futures/um/daily/metrics";

/// The sampling interval of the published metrics files.
const VISION_INTERVAL: &str = "5m";

pub struct VisionDownloader {
    http: reqwest::Client,
    store: MarketStore,
    limiters: Arc<EndpointLimiters>,
    base_url: String,
}

impl VisionDownloader {
    pub fn new(store: MarketStore, limiters: Arc<EndpointLimiters>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("marketpipe/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            store,
            limiters,
            base_url: VISION_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch daily metrics archives for every symbol and day in the window
    /// and upsert their rows. A missing archive (404) counts as a day
    /// without data, not a failure.
    pub async fn download_metrics(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        retry: RetryConfig,
    ) -> Result<IntegrityReport> {
        if symbols.is_empty() {
            return Ok(IntegrityReport::empty());
        }
        let start = time::parse_date(start_date)?;
        let end = time::parse_date(end_date)?;
        info!(
            "vision metrics download: {} symbols, {start_date}..{end_date}",
            symbols.len()
        );

        let mut failed: Vec<String> = Vec::new();
        let mut missing: Vec<MissingPeriod> = Vec::new();
        let mut successful = 0usize;

        for symbol in symbols {
            let mut symbol_failed = false;
            let mut day = start;
            while day <= end {
                let date = day.format("%Y-%m-%d").to_string();
                let url = format!("{}/{symbol}/{symbol}-metrics-{date}.zip", self.base_url);

                let archive = fetch_with_policy(
                    &format!("vision:{symbol}:{date}"),
                    &self.limiters.batch,
                    retry,
                    || self.fetch_archive(&url),
                )
                .await;

                match archive {
                    Ok(Some(bytes)) => match self.ingest_archive(&bytes, symbol).await {
                        Ok((oi_rows, lsr_rows)) => {
                            debug!("{symbol} {date}: {oi_rows} OI rows, {lsr_rows} LSR rows");
                        }
                        Err(e) => {
                            warn!("{symbol} {date}: archive parse failed: {e}");
                            missing.push(MissingPeriod {
                                symbol: symbol.clone(),
                                period: date.clone(),
                                reason: format!("archive parse failed: {e}"),
                            });
                            symbol_failed = true;
                        }
                    },
                    Ok(None) => {
                        missing.push(MissingPeriod {
                            symbol: symbol.clone(),
                            period: date.clone(),
                            reason: "no archive published".into(),
                        });
                    }
                    Err(e) => {
                        warn!("{symbol} {date}: download failed: {e}");
                        missing.push(MissingPeriod {
                            symbol: symbol.clone(),
                            period: date.clone(),
                            reason: e.to_string(),
                        });
                        symbol_failed = true;
                    }
                }
                day = day.succ_opt().context("date overflow")?;
            }
            if symbol_failed {
                failed.push(symbol.clone());
            } else {
                successful += 1;
            }
        }

        let total = symbols.len();
        let score = if total > 0 {
            successful as f64 / total as f64
        } else {
            1.0
        };
        Ok(IntegrityReport {
            total_symbols: total,
            successful_symbols: successful,
            failed_symbols: failed,
            missing_periods: missing,
            data_quality_score: score,
            recommendations: Vec::new(),
        })
    }

    /// `Ok(None)` for a 404 (day not published).
    async fn fetch_archive(&self, url: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ClientError::Transient(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ClientError::RateLimited { retry_after: None }),
            status if status.is_server_error() => {
                Err(ClientError::Transient(format!("{status} from {url}")))
            }
            status => Err(ClientError::Other(format!("{status} from {url}"))),
        }
    }

    async fn ingest_archive(&self, bytes: &[u8], symbol: &str) -> Result<(usize, usize)> {
        let mut open_interest = Vec::new();
        let mut ratios = Vec::new();
        for csv in extract_csvs(bytes)? {
            let (oi, lsr) = parse_metrics_csv(&csv, symbol);
            open_interest.extend(oi);
            ratios.extend(lsr);
        }
        let oi_rows = self.store.insert_open_interest(&open_interest).await?;
        let lsr_rows = self.store.insert_long_short_ratios(&ratios).await?;
        Ok((oi_rows, lsr_rows))
    }
}

fn extract_csvs(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("not a valid ZIP archive")?;
    let mut csvs = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("corrupt ZIP entry")?;
        if !file.name().ends_with(".csv") {
            continue;
        }
        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("ZIP entry is not UTF-8 text")?;
        csvs.push(content);
    }
    Ok(csvs)
}

/// Parse one metrics CSV into storage rows.
///
/// Canonical columns: `create_time`, `sum_open_interest`,
/// `sum_open_interest_value`, `sum_toptrader_long_short_ratio`,
/// `count_toptrader_long_short_ratio`, `sum_taker_long_short_vol_ratio`.
/// The top-trader sum is averaged by its count where present; long/short
/// shares derive from the ratio (`r/(r+1)`, `1/(r+1)`).
fn parse_metrics_csv(content: &str, symbol: &str) -> (Vec<OpenInterest>, Vec<LongShortRatio>) {
    let mut lines = content.lines();
    let Some(header) = lines.next() else {
        return (Vec::new(), Vec::new());
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let col = |name: &str| columns.iter().position(|c| *c == name);

    let create_time = col("create_time");
    let sum_oi = col("sum_open_interest");
    let sum_oi_value = col("sum_open_interest_value");
    let sum_toptrader = col("sum_toptrader_long_short_ratio");
    let count_toptrader = col("count_toptrader_long_short_ratio");
    let sum_taker = col("sum_taker_long_short_vol_ratio");

    let mut open_interest = Vec::new();
    let mut ratios = Vec::new();

    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let get = |idx: Option<usize>| idx.and_then(|i| fields.get(i)).copied();
        let get_f64 = |idx: Option<usize>| get(idx).and_then(|v| v.parse::<f64>().ok());

        let Some(ts) = get(create_time).and_then(parse_create_time) else {
            continue;
        };

        if let Some(oi) = get_f64(sum_oi) {
            open_interest.push(OpenInterest {
                symbol: symbol.to_string(),
                timestamp: ts,
                interval: VISION_INTERVAL.to_string(),
                open_interest: oi,
                open_interest_value: get_f64(sum_oi_value),
            });
        }

        if let Some(mut ratio) = get_f64(sum_toptrader) {
            if let Some(count) = get_f64(count_toptrader) {
                if count > 0.0 {
                    ratio /= count;
                }
            }
            let (long_side, short_side) = ratio_shares(ratio);
            ratios.push(LongShortRatio {
                symbol: symbol.to_string(),
                timestamp: ts,
                period: VISION_INTERVAL.to_string(),
                ratio_type: RatioType::ToptraderAccount,
                long_short_ratio: ratio,
                long_account: Some(long_side),
                short_account: Some(short_side),
            });
        }

        if let Some(ratio) = get_f64(sum_taker) {
            let (long_side, short_side) = ratio_shares(ratio);
            ratios.push(LongShortRatio {
                symbol: symbol.to_string(),
                timestamp: ts,
                period: VISION_INTERVAL.to_string(),
                ratio_type: RatioType::TakerVol,
                long_short_ratio: ratio,
                long_account: Some(long_side),
                short_account: Some(short_side),
            });
        }
    }
    (open_interest, ratios)
}

fn ratio_shares(ratio: f64) -> (f64, f64) {
    if ratio > 0.0 {
        let total = ratio + 1.0;
        (ratio / total, 1.0 / total)
    } else {
        (0.5, 0.5)
    }
}

fn parse_create_time(raw: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "\
create_time,symbol,sum_open_interest,sum_open_interest_value,count_toptrader_long_short_ratio,sum_toptrader_long_short_ratio,count_long_short_ratio,sum_taker_long_short_vol_ratio
2024-01-01 00:00:00,BTCUSDT,80000.5,3400000000.0,4,8.0,100,1.5
2024-01-01 00:05:00,BTCUSDT,80010.0,3400400000.0,4,6.0,100,0.0
garbage line without enough fields
2024-01-01 00:10:00,BTCUSDT,not_a_number,,,,,";

    #[test]
    fn csv_rows_map_to_storage_records() {
        let (oi, lsr) = parse_metrics_csv(CSV, "BTCUSDT");

        assert_eq!(oi.len(), 2);
        assert_eq!(oi[0].timestamp, 1_704_067_200_000);
        assert!((oi[0].open_interest - 80000.5).abs() < 1e-9);
        assert_eq!(oi[0].interval, "5m");

        // Two rows x (toptrader + taker) minus the zero-taker row keeps its
        // record too (ratio 0 maps to even shares).
        assert_eq!(lsr.len(), 4);
        let toptrader: Vec<&LongShortRatio> = lsr
            .iter()
            .filter(|r| r.ratio_type == RatioType::ToptraderAccount)
            .collect();
        // sum 8.0 over count 4 averages to 2.0.
        assert!((toptrader[0].long_short_ratio - 2.0).abs() < 1e-9);
        assert!((toptrader[0].long_account.unwrap() - 2.0 / 3.0).abs() < 1e-9);

        let taker_zero = lsr
            .iter()
            .find(|r| r.ratio_type == RatioType::TakerVol && r.long_short_ratio == 0.0)
            .unwrap();
        assert_eq!(taker_zero.long_account, Some(0.5));
        assert_eq!(taker_zero.short_account, Some(0.5));
    }

    #[test]
    fn zip_extraction_finds_csv_entries() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            writer.start_file("BTCUSDT-metrics-2024-01-01.csv", options).unwrap();
            writer.write_all(CSV.as_bytes()).unwrap();
            writer.start_file("README.txt", options).unwrap();
            writer.write_all(b"not a csv").unwrap();
            writer.finish().unwrap();
        }
        let csvs = extract_csvs(buf.get_ref()).unwrap();
        assert_eq!(csvs.len(), 1);
        assert!(csvs[0].starts_with("create_time"));
    }

    #[tokio::test]
    async fn archive_rows_land_in_the_store() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            writer.start_file("metrics.csv", options).unwrap();
            writer.write_all(CSV.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let store = MarketStore::in_memory().unwrap();
        let downloader =
            VisionDownloader::new(store.clone(), Arc::new(EndpointLimiters::unthrottled()));
        let (oi_rows, lsr_rows) = downloader
            .ingest_archive(buf.get_ref(), "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(oi_rows, 2);
        assert_eq!(lsr_rows, 4);

        let summary = store.data_summary().await.unwrap();
        assert_eq!(summary.open_interest.rows, 2);
        assert_eq!(summary.long_short_ratio.rows, 4);
    }
}
