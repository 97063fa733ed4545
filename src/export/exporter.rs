//! Combined K-line + metrics exporter.
//!
//! One call loads the window at the source frequency, resamples if the
//! export frequency differs, aligns each requested metric as-of onto the
//! bar index, and materialises per-UTC-day `K x T` feature matrices plus an
//! `(N_types, K, T)` timestamp cube and the day->symbol-order JSON index.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::export::npy;
use crate::frame::{
    align_to_kline_timestamps, resample_klines, resample_with_strategy, Agg, AlignMethod, Frame,
};
use crate::models::{Freq, RatioType};
use crate::storage::MarketStore;
use crate::time;

/// Which metric families an export carries.
#[derive(Debug, Clone)]
pub struct MetricsSelection {
    pub funding_rate: bool,
    pub open_interest: bool,
    /// Also export `open_interest_value` (`oiv`) next to `oi`.
    pub open_interest_value: bool,
    /// Ratio types to export; empty disables the family.
    pub long_short_ratio: Vec<RatioType>,
}

impl Default for MetricsSelection {
    fn default() -> Self {
        Self {
            funding_rate: true,
            open_interest: true,
            open_interest_value: true,
            long_short_ratio: RatioType::all().to_vec(),
        }
    }
}

impl MetricsSelection {
    pub fn none() -> Self {
        Self {
            funding_rate: false,
            open_interest: false,
            open_interest_value: false,
            long_short_ratio: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub include_klines: bool,
    pub include_metrics: bool,
    pub metrics: MetricsSelection,
    /// Long->short column renames applied before writing; defaults to
    /// [`default_field_mapping`]. Unmapped columns keep their names.
    pub field_mapping: Option<BTreeMap<String, String>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_klines: true,
            include_metrics: true,
            metrics: MetricsSelection::default(),
            field_mapping: None,
        }
    }
}

/// Exported file-directory names for the K-line and metric columns.
pub fn default_field_mapping() -> BTreeMap<String, String> {
    [
        ("open_price", "opn"),
        ("high_price", "hgh"),
        ("low_price", "low"),
        ("close_price", "cls"),
        ("volume", "vol"),
        ("quote_volume", "amt"),
        ("trades_count", "tnum"),
        ("taker_buy_volume", "tbvol"),
        ("taker_buy_quote_volume", "tbamt"),
        ("taker_sell_volume", "tsvol"),
        ("taker_sell_quote_volume", "tsamt"),
        ("funding_rate", "fr"),
        ("open_interest", "oi"),
        ("open_interest_value", "oiv"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// What an export run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub days: Vec<String>,
    pub features: Vec<String>,
    pub timestamp_series: Vec<String>,
    pub rows: usize,
}

/// Stacking order of the timestamp cube. Series not captured by a run are
/// skipped, the relative order is fixed.
const TIMESTAMP_SERIES_ORDER: [&str; 8] = [
    "open_timestamp",
    "close_timestamp",
    "oi_timestamp",
    "lsr_toptrader_account_timestamp",
    "lsr_toptrader_position_timestamp",
    "lsr_global_account_timestamp",
    "lsr_taker_vol_timestamp",
    "fr_timestamp",
];

pub struct NumpyExporter {
    store: MarketStore,
    /// Serialises read-modify-write of `univ_dct2.json` across concurrent
    /// per-day writers.
    index_lock: Mutex<()>,
}

impl NumpyExporter {
    pub fn new(store: MarketStore) -> Self {
        Self {
            store,
            index_lock: Mutex::new(()),
        }
    }

    /// Export `[start_date, end_date]` for `symbols`, reading bars at
    /// `source_freq` and writing matrices at `export_freq`.
    #[allow(clippy::too_many_arguments)]
    pub async fn export_combined(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        source_freq: Freq,
        export_freq: Freq,
        output_dir: &Path,
        opts: &ExportOptions,
    ) -> Result<ExportReport> {
        if symbols.is_empty() {
            warn!("export requested with no symbols");
            return Ok(ExportReport {
                days: Vec::new(),
                features: Vec::new(),
                timestamp_series: Vec::new(),
                rows: 0,
            });
        }
        let start_date = time::standardize_date(start_date)?;
        let end_date = time::standardize_date(end_date)?;
        info!(
            "export: {} symbols, {start_date}..{end_date}, {source_freq} -> {export_freq}",
            symbols.len()
        );

        // 1. Source bars, including the close_time column for the cube.
        let mut columns: Vec<&str> = crate::storage::KLINE_FEATURES.to_vec();
        columns.push("close_time");
        let klines = self
            .store
            .select_klines(symbols, &start_date, &end_date, source_freq, Some(&columns), false)
            .await?;
        if klines.is_empty() {
            bail!(PipelineError::MissingSource(format!(
                "no {source_freq} kline rows in {start_date}..{end_date}"
            )));
        }

        // 2. Resample to the export frequency.
        let mut combined = resample_klines(&klines, source_freq, export_freq)?;

        // 3. Capture open/close timestamp series, then drop close_time from
        // the data columns (it is cube-only in exports).
        let mut ts_series: BTreeMap<&'static str, Frame> = BTreeMap::new();
        ts_series.insert("open_timestamp", index_timestamps(&combined));
        let close_time = combined.drop_column("close_time")?;
        ts_series.insert(
            "close_timestamp",
            column_timestamps(&combined, close_time),
        );

        // 4. Metrics: query raw, resample, as-of align, merge.
        if opts.include_metrics {
            self.merge_metrics(
                &mut combined,
                &mut ts_series,
                symbols,
                &start_date,
                &end_date,
                export_freq,
                &opts.metrics,
            )
            .await?;
        }

        // 5. Rename to the exported short names.
        let mapping = opts
            .field_mapping
            .clone()
            .unwrap_or_else(default_field_mapping);
        for (long, short) in &mapping {
            if combined.column(long).is_some() {
                combined.rename_column(long, short)?;
            }
        }

        if !opts.include_klines {
            // Metric-only exports drop the renamed K-line columns.
            for (long, short) in &mapping {
                if crate::storage::KLINE_FEATURES.contains(&long.as_str()) {
                    let _ = combined.drop_column(short);
                }
            }
        }

        // 6. Per-day matrices, cube, and the symbol-order index.
        let days = combined.day_keys();
        let captured: Vec<&str> = TIMESTAMP_SERIES_ORDER
            .iter()
            .copied()
            .filter(|k| ts_series.contains_key(k))
            .collect();
        for day in &days {
            self.export_day(&combined, &ts_series, &captured, day, output_dir)?;
        }

        info!(
            "export complete: {} days, {} features, {} rows",
            days.len(),
            combined.columns().len(),
            combined.len()
        );
        Ok(ExportReport {
            days,
            features: combined.columns().to_vec(),
            timestamp_series: captured.iter().map(|s| s.to_string()).collect(),
            rows: combined.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_metrics(
        &self,
        combined: &mut Frame,
        ts_series: &mut BTreeMap<&'static str, Frame>,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        export_freq: Freq,
        selection: &MetricsSelection,
    ) -> Result<()> {
        if selection.funding_rate {
            let raw = self
                .store
                .select_funding_rates(symbols, start_date, end_date, Some(&["funding_rate"]))
                .await?;
            if raw.is_empty() {
                debug!("no funding rate rows to merge");
            } else {
                let strategy = BTreeMap::from([("funding_rate".to_string(), Agg::Last)]);
                let resampled = resample_with_strategy(&raw, export_freq, &strategy)?;
                let aligned = align_to_kline_timestamps(&resampled, combined, AlignMethod::Asof);
                combined.merge_columns(&aligned.frame)?;
                ts_series.insert("fr_timestamp", aligned.original_ts);
            }
        }

        if selection.open_interest {
            let mut columns = vec!["open_interest"];
            if selection.open_interest_value {
                columns.push("open_interest_value");
            }
            let raw = self
                .store
                .select_open_interest(symbols, start_date, end_date, Some(&columns))
                .await?;
            if raw.is_empty() {
                debug!("no open interest rows to merge");
            } else {
                let strategy: BTreeMap<String, Agg> = columns
                    .iter()
                    .map(|c| (c.to_string(), Agg::Last))
                    .collect();
                let resampled = resample_with_strategy(&raw, export_freq, &strategy)?;
                let aligned = align_to_kline_timestamps(&resampled, combined, AlignMethod::Asof);
                combined.merge_columns(&aligned.frame)?;
                ts_series.insert("oi_timestamp", aligned.original_ts);
            }
        }

        for ratio_type in &selection.long_short_ratio {
            let raw = self
                .store
                .select_long_short_ratio_by_type(symbols, start_date, end_date, *ratio_type, true)
                .await?;
            if raw.is_empty() {
                debug!("no {ratio_type} rows to merge");
                continue;
            }
            let export_name = ratio_type.export_name().to_string();
            let strategy = BTreeMap::from([(export_name, Agg::Last)]);
            let resampled = resample_with_strategy(&raw, export_freq, &strategy)?;
            let aligned = align_to_kline_timestamps(&resampled, combined, AlignMethod::Asof);
            combined.merge_columns(&aligned.frame)?;
            let key = match ratio_type {
                RatioType::ToptraderAccount => "lsr_toptrader_account_timestamp",
                RatioType::ToptraderPosition => "lsr_toptrader_position_timestamp",
                RatioType::GlobalAccount => "lsr_global_account_timestamp",
                RatioType::TakerVol => "lsr_taker_vol_timestamp",
            };
            ts_series.insert(key, aligned.original_ts);
        }
        Ok(())
    }

    fn export_day(
        &self,
        combined: &Frame,
        ts_series: &BTreeMap<&'static str, Frame>,
        captured: &[&str],
        day: &str,
        output_dir: &Path,
    ) -> Result<()> {
        let day_start = time::date_to_ts_start(&format!(
            "{}-{}-{}",
            &day[0..4],
            &day[4..6],
            &day[6..8]
        ))?;
        let day_end = day_start + 86_400_000 - 1;
        let slice = combined.slice_time(day_start, day_end);
        if slice.is_empty() {
            return Ok(());
        }

        let day_symbols = slice.symbols();
        let ts_axis = day_time_axis(&slice);
        let k = day_symbols.len();
        let t = ts_axis.len();
        debug!("export day {day}: K={k}, T={t}");

        // Feature matrices, forward-filled along time per symbol.
        for (col, name) in slice.columns().to_vec().iter().enumerate() {
            let mut matrix = day_matrix(&slice, col, &day_symbols, &ts_axis);
            forward_fill_rows(&mut matrix, k, t);
            npy::write_f64_2d(
                &output_dir.join(name).join(format!("{day}.npy")),
                &matrix,
                (k, t),
            )?;
        }

        // Timestamp cube: captured series stacked in fixed order, NaN -> 0.
        let mut cube: Vec<i64> = Vec::with_capacity(captured.len() * k * t);
        for key in captured {
            let series = &ts_series[key];
            let series_slice = series.slice_time(day_start, day_end);
            let col = series_slice
                .column_position("timestamp")
                .or_else(|| series_slice.column_position("original_timestamp"))
                .context("timestamp series has no timestamp column")?;
            let matrix = day_matrix(&series_slice, col, &day_symbols, &ts_axis);
            cube.extend(
                matrix
                    .into_iter()
                    .map(|v| if v.is_nan() { 0 } else { v as i64 }),
            );
        }
        if !captured.is_empty() {
            npy::write_i64_3d(
                &output_dir.join("timestamp").join(format!("{day}.npy")),
                &cube,
                (captured.len(), k, t),
            )?;
        }

        self.update_symbol_index(output_dir, day, &day_symbols)?;
        Ok(())
    }

    /// Read-modify-write of `univ_dct2.json` under the exporter lock so
    /// per-day writers do not clobber one another.
    fn update_symbol_index(&self, output_dir: &Path, day: &str, symbols: &[String]) -> Result<()> {
        let _guard = self.index_lock.lock();
        let path: PathBuf = output_dir.join("univ_dct2.json");
        let mut payload: BTreeMap<String, Vec<String>> = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("symbol index {} is malformed ({e}), rebuilding", path.display());
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        payload.insert(day.to_string(), symbols.to_vec());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Write `summary.json` describing what the window holds.
    pub async fn export_summary(
        &self,
        symbols: &[String],
        start_date: &str,
        end_date: &str,
        freq: Freq,
        output_dir: &Path,
    ) -> Result<()> {
        let frame = self
            .store
            .select_klines(symbols, start_date, end_date, freq, Some(&["close_price"]), false)
            .await?;
        let summary = if frame.is_empty() {
            json!({
                "status": "no_data",
                "symbols": symbols,
                "period": format!("{start_date} - {end_date}"),
            })
        } else {
            let timestamps: Vec<i64> = frame.index().iter().map(|(_, ts)| *ts).collect();
            json!({
                "status": "success",
                "symbols": symbols,
                "actual_symbols": frame.symbols(),
                "period": format!("{start_date} - {end_date}"),
                "frequency": freq.as_str(),
                "total_records": frame.len(),
                "unique_dates": frame.day_keys().len(),
                "first_timestamp": timestamps.iter().min(),
                "last_timestamp": timestamps.iter().max(),
            })
        };
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join("summary.json");
        fs::write(&path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// One-column frame holding each row's own index timestamp.
fn index_timestamps(frame: &Frame) -> Frame {
    let rows = frame
        .index()
        .iter()
        .map(|(symbol, ts)| (symbol.clone(), *ts, vec![*ts as f64]))
        .collect();
    Frame::from_rows(vec!["timestamp".to_string()], rows).expect("arity is consistent")
}

/// One-column frame holding a data column (e.g. close_time) as timestamps.
fn column_timestamps(frame: &Frame, values: Vec<f64>) -> Frame {
    let rows = frame
        .index()
        .iter()
        .zip(values)
        .map(|((symbol, ts), v)| (symbol.clone(), *ts, vec![v]))
        .collect();
    Frame::from_rows(vec!["timestamp".to_string()], rows).expect("arity is consistent")
}

/// Distinct sorted timestamps present in a day slice.
fn day_time_axis(slice: &Frame) -> Vec<i64> {
    let mut ts: Vec<i64> = slice.index().iter().map(|(_, t)| *t).collect();
    ts.sort_unstable();
    ts.dedup();
    ts
}

/// `K x T` row-major matrix of one column over (symbols x time axis),
/// NaN where a symbol has no row at a timestamp.
fn day_matrix(slice: &Frame, col: usize, symbols: &[String], ts_axis: &[i64]) -> Vec<f64> {
    let t = ts_axis.len();
    let mut matrix = vec![f64::NAN; symbols.len() * t];
    for (k, symbol) in symbols.iter().enumerate() {
        let Some(range) = slice.symbol_range(symbol) else {
            continue;
        };
        for row in range {
            let ts = slice.index()[row].1;
            if let Ok(pos) = ts_axis.binary_search(&ts) {
                matrix[k * t + pos] = slice.value(row, col);
            }
        }
    }
    matrix
}

/// Forward-fill each row along the time axis; leading NaNs stay NaN.
fn forward_fill_rows(matrix: &mut [f64], k: usize, t: usize) {
    for row in 0..k {
        let mut last = f64::NAN;
        for cell in matrix[row * t..(row + 1) * t].iter_mut() {
            if cell.is_nan() {
                if !last.is_nan() {
                    *cell = last;
                }
            } else {
                last = *cell;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FundingRate, PerpKline};

    const DAY0: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
    const HOUR: i64 = 3_600_000;

    fn kline(symbol: &str, open_time: i64, close: f64) -> PerpKline {
        PerpKline {
            symbol: symbol.to_string(),
            open_time,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            quote_volume: 1000.0,
            trades_count: 7,
            taker_buy_volume: 6.0,
            taker_buy_quote_volume: 600.0,
            close_time: open_time + HOUR - 1,
        }
    }

    async fn seeded_store() -> MarketStore {
        let store = MarketStore::in_memory().unwrap();
        let mut rows = Vec::new();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            for i in 0..24 {
                rows.push(kline(symbol, DAY0 + i * HOUR, 100.0 + i as f64));
            }
        }
        store.insert_klines(&rows, Freq::H1).await.unwrap();
        store
            .insert_funding_rates(&[
                FundingRate {
                    symbol: "BTCUSDT".into(),
                    funding_time: DAY0,
                    funding_rate: 0.0001,
                    mark_price: None,
                    index_price: None,
                },
                FundingRate {
                    symbol: "BTCUSDT".into(),
                    funding_time: DAY0 + 8 * HOUR,
                    funding_rate: 0.0002,
                    mark_price: None,
                    index_price: None,
                },
                FundingRate {
                    symbol: "BTCUSDT".into(),
                    funding_time: DAY0 + 16 * HOUR,
                    funding_rate: 0.0003,
                    mark_price: None,
                    index_price: None,
                },
                FundingRate {
                    symbol: "ETHUSDT".into(),
                    funding_time: DAY0 + 8 * HOUR,
                    funding_rate: -0.0001,
                    mark_price: None,
                    index_price: None,
                },
            ])
            .await
            .unwrap();
        store
    }

    fn funding_only() -> ExportOptions {
        ExportOptions {
            metrics: MetricsSelection {
                funding_rate: true,
                open_interest: false,
                open_interest_value: false,
                long_short_ratio: Vec::new(),
            },
            ..ExportOptions::default()
        }
    }

    #[tokio::test]
    async fn daily_export_produces_consistent_shapes() {
        let store = seeded_store().await;
        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();

        let report = exporter
            .export_combined(
                &["BTCUSDT".into(), "ETHUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::D1,
                dir.path(),
                &funding_only(),
            )
            .await
            .unwrap();

        assert_eq!(report.days, vec!["20240101"]);
        for feature in [
            "opn", "hgh", "low", "cls", "vol", "amt", "tnum", "tbvol", "tbamt", "tsvol", "tsamt",
            "fr",
        ] {
            let path = dir.path().join(feature).join("20240101.npy");
            assert!(path.exists(), "missing {feature}");
            let (_, shape) = npy::read_f64_2d(&path).unwrap();
            assert_eq!(shape, (2, 1), "bad shape for {feature}");
        }

        // open_ts, close_ts, fr_ts stacked.
        let (cube, shape) = npy::read_i64_3d(&dir.path().join("timestamp/20240101.npy")).unwrap();
        assert_eq!(shape, (3, 2, 1));
        assert_eq!(report.timestamp_series.len(), 3);
        // open_ts for both symbols is the daily bar label.
        assert_eq!(cube[0], DAY0);
        assert_eq!(cube[1], DAY0);

        let index: BTreeMap<String, Vec<String>> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("univ_dct2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(index["20240101"], vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn no_close_time_feature_directory_is_written() {
        let store = seeded_store().await;
        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();
        exporter
            .export_combined(
                &["BTCUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::H1,
                dir.path(),
                &funding_only(),
            )
            .await
            .unwrap();
        assert!(!dir.path().join("close_time").exists());
        assert!(!dir.path().join("ctm").exists());
        assert!(dir.path().join("timestamp/20240101.npy").exists());
    }

    #[tokio::test]
    async fn hourly_export_has_24_columns_and_monotone_timestamps() {
        let store = seeded_store().await;
        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();
        exporter
            .export_combined(
                &["BTCUSDT".into(), "ETHUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::H1,
                dir.path(),
                &funding_only(),
            )
            .await
            .unwrap();

        let (cls, shape) = npy::read_f64_2d(&dir.path().join("cls/20240101.npy")).unwrap();
        assert_eq!(shape, (2, 24));
        assert_eq!(cls[0], 100.0);
        assert_eq!(cls[23], 123.0);

        let (cube, (n, k, t)) =
            npy::read_i64_3d(&dir.path().join("timestamp/20240101.npy")).unwrap();
        assert_eq!((n, k, t), (3, 2, 24));
        // Non-zero entries are non-decreasing along the time axis and never
        // exceed the day boundary.
        let day_end = DAY0 + 86_400_000 - 1;
        for series in 0..n {
            for row in 0..k {
                let mut prev = i64::MIN;
                for col in 0..t {
                    let v = cube[series * k * t + row * t + col];
                    if v != 0 {
                        assert!(v >= prev, "series {series} row {row} col {col} decreased");
                        assert!(v <= day_end);
                        prev = v;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn funding_values_are_aligned_without_lookahead() {
        let store = seeded_store().await;
        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();
        exporter
            .export_combined(
                &["BTCUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::H1,
                dir.path(),
                &funding_only(),
            )
            .await
            .unwrap();

        let (fr, (_, t)) = npy::read_f64_2d(&dir.path().join("fr/20240101.npy")).unwrap();
        assert_eq!(t, 24);
        // Events at hours 0, 8, 16: hour 7 still sees the first event,
        // hour 8 the second.
        assert_eq!(fr[0], 0.0001);
        assert_eq!(fr[7], 0.0001);
        assert_eq!(fr[8], 0.0002);
        assert_eq!(fr[15], 0.0002);
        assert_eq!(fr[16], 0.0003);
        assert_eq!(fr[23], 0.0003);
    }

    #[tokio::test]
    async fn missing_source_fails_the_export() {
        let store = MarketStore::in_memory().unwrap();
        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();
        let err = exporter
            .export_combined(
                &["BTCUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::D1,
                dir.path(),
                &ExportOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingSource(_))
        ));
    }

    #[tokio::test]
    async fn partial_days_keep_leading_nans_and_forward_fill() {
        let store = MarketStore::in_memory().unwrap();
        // BTC trades all day; ETH only hours 3..6 with a gap at hour 5.
        let mut rows = Vec::new();
        for i in 0..24 {
            rows.push(kline("BTCUSDT", DAY0 + i * HOUR, 100.0 + i as f64));
        }
        for i in [3i64, 4, 6] {
            rows.push(kline("ETHUSDT", DAY0 + i * HOUR, 200.0 + i as f64));
        }
        store.insert_klines(&rows, Freq::H1).await.unwrap();

        let exporter = NumpyExporter::new(store);
        let dir = tempfile::tempdir().unwrap();
        exporter
            .export_combined(
                &["BTCUSDT".into(), "ETHUSDT".into()],
                "2024-01-01",
                "2024-01-01",
                Freq::H1,
                Freq::H1,
                dir.path(),
                &ExportOptions {
                    include_metrics: false,
                    metrics: MetricsSelection::none(),
                    ..ExportOptions::default()
                },
            )
            .await
            .unwrap();

        let (cls, (k, t)) = npy::read_f64_2d(&dir.path().join("cls/20240101.npy")).unwrap();
        assert_eq!((k, t), (2, 24));
        // ETH: leading NaNs before hour 3, gap at hour 5 forward-filled,
        // trailing hours carry hour 6 onward.
        let eth = &cls[24..48];
        assert!(eth[0].is_nan());
        assert!(eth[2].is_nan());
        assert_eq!(eth[3], 203.0);
        assert_eq!(eth[5], 204.0); // filled from hour 4
        assert_eq!(eth[6], 206.0);
        assert_eq!(eth[23], 206.0);
    }
}
