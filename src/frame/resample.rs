//! Time downsampling over `(symbol, timestamp)` frames.
//!
//! Buckets are left-closed and left-labelled, aligned to the UTC epoch:
//! a row at `ts` lands in the bucket labelled `ts - ts.rem_euclid(stride)`.
//! Only downsampling is defined; the target stride must be an integer
//! multiple of the source stride.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use crate::frame::Frame;
use crate::models::Freq;

/// Bucket aggregation for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    First,
    Max,
    Min,
    Last,
    Sum,
}

impl Agg {
    fn fold(&self, values: impl Iterator<Item = f64>) -> f64 {
        let mut acc = f64::NAN;
        let mut seen = false;
        for v in values {
            if v.is_nan() {
                continue;
            }
            if !seen {
                acc = v;
                seen = true;
                continue;
            }
            acc = match self {
                Agg::First => acc,
                Agg::Last => v,
                Agg::Max => acc.max(v),
                Agg::Min => acc.min(v),
                Agg::Sum => acc + v,
            };
        }
        acc
    }
}

/// OHLCV aggregation for a standard K-line column, by name.
pub fn kline_agg(column: &str) -> Option<Agg> {
    match column {
        "open_price" => Some(Agg::First),
        "high_price" => Some(Agg::Max),
        "low_price" => Some(Agg::Min),
        "close_price" => Some(Agg::Last),
        "close_time" => Some(Agg::Last),
        "volume" | "quote_volume" | "trades_count" | "taker_buy_volume"
        | "taker_buy_quote_volume" | "taker_sell_volume" | "taker_sell_quote_volume" => {
            Some(Agg::Sum)
        }
        _ => None,
    }
}

/// Downsample a K-line frame from `source` to `target` frequency using the
/// OHLCV aggregation map. Identity when `source == target`.
pub fn resample_klines(frame: &Frame, source: Freq, target: Freq) -> Result<Frame> {
    if source == target {
        return Ok(frame.clone());
    }
    let strategy: BTreeMap<String, Agg> = frame
        .columns()
        .iter()
        .map(|c| {
            kline_agg(c)
                .map(|agg| (c.clone(), agg))
                .with_context(|| format!("no OHLCV aggregation for column {c}"))
        })
        .collect::<Result<_>>()?;

    let source_stride = source
        .stride_ms()
        .with_context(|| format!("source frequency {source} has no fixed stride"))?;
    let target_stride = target
        .stride_ms()
        .with_context(|| format!("target frequency {target} has no fixed stride"))?;
    if target_stride < source_stride || target_stride % source_stride != 0 {
        bail!(
            "cannot resample {source} to {target}: target stride must be an integer multiple of the source stride"
        );
    }
    resample_with_strategy(frame, target, &strategy)
}

/// Downsample any frame into `target`-stride buckets with a caller-supplied
/// aggregation per column. Used for metric series (typically `last`).
pub fn resample_with_strategy(
    frame: &Frame,
    target: Freq,
    strategy: &BTreeMap<String, Agg>,
) -> Result<Frame> {
    let stride = target
        .stride_ms()
        .with_context(|| format!("target frequency {target} has no fixed stride"))?;

    let aggs: Vec<Agg> = frame
        .columns()
        .iter()
        .map(|c| {
            strategy
                .get(c)
                .copied()
                .with_context(|| format!("no aggregation for column {c}"))
        })
        .collect::<Result<_>>()?;

    let mut rows: Vec<(String, i64, Vec<f64>)> = Vec::new();
    for (symbol, range) in frame.symbol_ranges() {
        let mut bucket_start = range.start;
        while bucket_start < range.end {
            let label = bucket_label(frame.index()[bucket_start].1, stride);
            let mut bucket_end = bucket_start + 1;
            while bucket_end < range.end
                && bucket_label(frame.index()[bucket_end].1, stride) == label
            {
                bucket_end += 1;
            }
            let cells = aggs
                .iter()
                .enumerate()
                .map(|(col, agg)| {
                    agg.fold((bucket_start..bucket_end).map(|row| frame.value(row, col)))
                })
                .collect();
            rows.push((symbol.clone(), label, cells));
            bucket_start = bucket_end;
        }
    }
    Frame::from_rows(frame.columns().to_vec(), rows)
}

fn bucket_label(ts: i64, stride: i64) -> i64 {
    ts - ts.rem_euclid(stride)
}
