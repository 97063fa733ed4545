//! Alignment of asynchronous metric series onto K-line timestamps.
//!
//! The backward ("as-of") method is the production path: for each
//! `(symbol, kline_ts)` it takes the metric row with the largest
//! `metric_ts <= kline_ts`, so an aligned value is never younger than the
//! bar it is attached to. The `nearest` method can select a future row and
//! is therefore unsafe for backtesting; it exists for exploratory use and
//! still emits the original timestamps so violations are detectable.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::frame::{resample_with_strategy, Agg, Frame};
use crate::models::Freq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMethod {
    /// Backward-only selection; no lookahead by construction.
    Asof,
    /// Minimum absolute distance; may look ahead. Not for production use.
    Nearest,
}

/// An aligned metric frame plus the per-row source-timestamp audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct Aligned {
    /// Metric columns re-indexed onto the reference frame's index.
    pub frame: Frame,
    /// One `original_timestamp` column, NaN where no source row was used.
    pub original_ts: Frame,
}

/// Align `metrics` onto the index of `klines`.
///
/// The output is indexed identically to `klines`: exactly one row per
/// reference row, NaN cells for reference rows with no usable source
/// (including symbols absent from the metric frame).
pub fn align_to_kline_timestamps(metrics: &Frame, klines: &Frame, method: AlignMethod) -> Aligned {
    let n = klines.len();
    let width = metrics.columns().len();
    let mut aligned: Vec<Vec<f64>> = (0..width).map(|_| vec![f64::NAN; n]).collect();
    let mut original: Vec<f64> = vec![f64::NAN; n];

    for (symbol, kline_range) in klines.symbol_ranges() {
        let Some(metric_range) = metrics.symbol_range(symbol) else {
            continue;
        };
        let metric_ts: Vec<i64> = metrics.symbol_timestamps(&metric_range).collect();

        let mut cursor: usize = 0;
        for row in kline_range.clone() {
            let target = klines.index()[row].1;
            // Advance to the last metric row at or before the target.
            while cursor < metric_ts.len() && metric_ts[cursor] <= target {
                cursor += 1;
            }
            let picked = match method {
                AlignMethod::Asof => cursor.checked_sub(1),
                AlignMethod::Nearest => nearest_of(&metric_ts, cursor, target),
            };
            if let Some(offset) = picked {
                let source_row = metric_range.start + offset;
                for (col, out) in aligned.iter_mut().enumerate() {
                    out[row] = metrics.value(source_row, col);
                }
                original[row] = metric_ts[offset] as f64;
            }
        }
    }

    let rows: Vec<(String, i64, Vec<f64>)> = klines
        .index()
        .iter()
        .enumerate()
        .map(|(row, (symbol, ts))| {
            let cells: Vec<f64> = aligned.iter().map(|col| col[row]).collect();
            (symbol.clone(), *ts, cells)
        })
        .collect();
    let frame =
        Frame::from_rows(metrics.columns().to_vec(), rows).expect("aligned arity is consistent");

    let ts_rows: Vec<(String, i64, Vec<f64>)> = klines
        .index()
        .iter()
        .enumerate()
        .map(|(row, (symbol, ts))| (symbol.clone(), *ts, vec![original[row]]))
        .collect();
    let original_ts = Frame::from_rows(vec!["original_timestamp".to_string()], ts_rows)
        .expect("audit arity is consistent");

    Aligned { frame, original_ts }
}

/// Index of the metric row nearest to `target`, given `cursor` = first row
/// strictly after it.
fn nearest_of(metric_ts: &[i64], cursor: usize, target: i64) -> Option<usize> {
    let before = cursor.checked_sub(1);
    let after = (cursor < metric_ts.len()).then_some(cursor);
    match (before, after) {
        (Some(b), Some(a)) => {
            let db = (target - metric_ts[b]).abs();
            let da = (metric_ts[a] - target).abs();
            Some(if da < db { a } else { b })
        }
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Resample a metric frame to the target frequency, then align it onto the
/// K-line index. Returns the aligned frame and the original-timestamp audit
/// frame.
pub fn resample_and_align(
    metrics: &Frame,
    klines: &Frame,
    target: Freq,
    agg_strategy: &BTreeMap<String, Agg>,
    method: AlignMethod,
) -> Result<Aligned> {
    if metrics.is_empty() {
        let empty = Frame::empty(metrics.columns().to_vec());
        let empty_ts = Frame::empty(vec!["original_timestamp".to_string()]);
        return Ok(Aligned {
            frame: empty,
            original_ts: empty_ts,
        });
    }
    let resampled = resample_with_strategy(metrics, target, agg_strategy)?;
    Ok(align_to_kline_timestamps(&resampled, klines, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn klines(symbols: &[&str], hours: i64) -> Frame {
        let mut rows = Vec::new();
        for s in symbols {
            for i in 0..hours {
                rows.push((s.to_string(), i * HOUR, vec![100.0 + i as f64]));
            }
        }
        Frame::from_rows(vec!["close_price".into()], rows).unwrap()
    }

    fn metric(rows: Vec<(&str, i64, f64)>) -> Frame {
        Frame::from_rows(
            vec!["fr".into()],
            rows.into_iter()
                .map(|(s, ts, v)| (s.to_string(), ts, vec![v]))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn asof_takes_latest_at_or_before() {
        let reference = klines(&["BTCUSDT"], 4);
        let metrics = metric(vec![
            ("BTCUSDT", 0, 0.1),
            ("BTCUSDT", HOUR + 1, 0.2),
            ("BTCUSDT", 3 * HOUR, 0.3),
        ]);
        let out = align_to_kline_timestamps(&metrics, &reference, AlignMethod::Asof);
        assert_eq!(out.frame.column("fr").unwrap()[0], 0.1);
        assert_eq!(out.frame.column("fr").unwrap()[1], 0.1); // 1h row predates the 1h+1ms event
        assert_eq!(out.frame.column("fr").unwrap()[2], 0.2);
        assert_eq!(out.frame.column("fr").unwrap()[3], 0.3); // equal timestamps are usable

        let audited = out.original_ts.column("original_timestamp").unwrap();
        assert_eq!(audited[1], 0.0);
        assert_eq!(audited[3], (3 * HOUR) as f64);
    }

    #[test]
    fn asof_never_looks_ahead() {
        let reference = klines(&["BTCUSDT", "ETHUSDT"], 6);
        let metrics = metric(vec![
            ("BTCUSDT", HOUR / 2, 1.0),
            ("BTCUSDT", 2 * HOUR + 7, 2.0),
            ("ETHUSDT", 5 * HOUR - 1, 3.0),
        ]);
        let out = align_to_kline_timestamps(&metrics, &reference, AlignMethod::Asof);
        for (row, (_, kline_ts)) in out.original_ts.index().iter().enumerate() {
            let source = out.original_ts.column("original_timestamp").unwrap()[row];
            assert!(source.is_nan() || source <= *kline_ts as f64);
        }
    }

    #[test]
    fn alignment_covers_every_reference_row_exactly_once() {
        let reference = klines(&["BTCUSDT", "ETHUSDT"], 3);
        let metrics = metric(vec![("BTCUSDT", 0, 1.0)]);
        let out = align_to_kline_timestamps(&metrics, &reference, AlignMethod::Asof);
        assert_eq!(out.frame.index(), reference.index());
        assert_eq!(out.original_ts.index(), reference.index());
        // ETHUSDT has no metrics: all NaN, still present.
        let range = out.frame.symbol_range("ETHUSDT").unwrap();
        for row in range {
            assert!(out.frame.value(row, 0).is_nan());
        }
    }

    #[test]
    fn leading_rows_without_history_are_nan() {
        let reference = klines(&["BTCUSDT"], 3);
        let metrics = metric(vec![("BTCUSDT", 2 * HOUR, 9.0)]);
        let out = align_to_kline_timestamps(&metrics, &reference, AlignMethod::Asof);
        let fr = out.frame.column("fr").unwrap();
        assert!(fr[0].is_nan());
        assert!(fr[1].is_nan());
        assert_eq!(fr[2], 9.0);
    }

    #[test]
    fn nearest_can_look_ahead_and_says_so() {
        let reference = klines(&["BTCUSDT"], 2);
        let metrics = metric(vec![("BTCUSDT", HOUR / 4, 7.0)]);
        let out = align_to_kline_timestamps(&metrics, &reference, AlignMethod::Nearest);
        // The bar at t=0 picks the future event; the audit trail exposes it.
        assert_eq!(out.frame.column("fr").unwrap()[0], 7.0);
        let audited = out.original_ts.column("original_timestamp").unwrap()[0];
        assert!(audited > 0.0);
    }

    #[test]
    fn empty_metrics_align_to_empty() {
        let reference = klines(&["BTCUSDT"], 2);
        let metrics = Frame::empty(vec!["fr".into()]);
        let out = resample_and_align(
            &metrics,
            &reference,
            Freq::H1,
            &BTreeMap::from([("fr".to_string(), Agg::Last)]),
            AlignMethod::Asof,
        )
        .unwrap();
        assert!(out.frame.is_empty());
    }

    #[test]
    fn resample_then_align_uses_bucket_labels() {
        let reference = klines(&["BTCUSDT"], 3);
        // Three events inside hour 1; `last` should win, labelled at 1h.
        let metrics = metric(vec![
            ("BTCUSDT", HOUR + 60_000, 0.1),
            ("BTCUSDT", HOUR + 120_000, 0.2),
            ("BTCUSDT", HOUR + 180_000, 0.3),
        ]);
        let out = resample_and_align(
            &metrics,
            &reference,
            Freq::H1,
            &BTreeMap::from([("fr".to_string(), Agg::Last)]),
            AlignMethod::Asof,
        )
        .unwrap();
        let fr = out.frame.column("fr").unwrap();
        assert!(fr[0].is_nan());
        assert_eq!(fr[1], 0.3);
        assert_eq!(fr[2], 0.3);
    }
}
