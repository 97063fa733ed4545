//! Demo: seed a day of synthetic bars and funding events, export matrices.
//!
//! Run with: cargo run --example export_day

use std::sync::Arc;

use marketpipe::client::mock::{MockExchange, SymbolScript};
use marketpipe::export::{ExportOptions, MetricsSelection, NumpyExporter};
use marketpipe::ingest::{KlineDownloadOptions, KlineDownloader};
use marketpipe::models::{Freq, FundingRate};
use marketpipe::storage::MarketStore;
use marketpipe::throttle::EndpointLimiters;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("marketpipe=info")
        .init();

    // A scripted exchange stands in for the real provider so the demo runs
    // offline; swap in `BinanceClient` for live data.
    let exchange = Arc::new(MockExchange::default());
    exchange.script(
        "BTCUSDT",
        SymbolScript::rows(MockExchange::hourly_rows_with_base("2024-01-01", 42_000.0)),
    );
    exchange.script(
        "ETHUSDT",
        SymbolScript::rows(MockExchange::hourly_rows_with_base("2024-01-01", 2_200.0)),
    );

    let store = MarketStore::open(std::path::Path::new("demo_market.db"), 4)?;
    let limiters = Arc::new(EndpointLimiters::default());

    let downloader = KlineDownloader::new(exchange, store.clone(), limiters);
    let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    let report = downloader
        .download_klines(
            &symbols,
            "2024-01-01",
            "2024-01-01",
            Freq::H1,
            &KlineDownloadOptions::default(),
        )
        .await?;
    println!(
        "downloaded {}/{} symbols (quality {:.2})",
        report.successful_symbols, report.total_symbols, report.data_quality_score
    );

    // Funding events arrive every 8 hours.
    let day_start = 1_704_067_200_000i64;
    let funding: Vec<FundingRate> = (0..3)
        .map(|i| FundingRate {
            symbol: "BTCUSDT".into(),
            funding_time: day_start + i * 8 * 3_600_000,
            funding_rate: 0.0001 * (i + 1) as f64,
            mark_price: None,
            index_price: None,
        })
        .collect();
    store.insert_funding_rates(&funding).await?;

    let exporter = NumpyExporter::new(store);
    let export_report = exporter
        .export_combined(
            &symbols,
            "2024-01-01",
            "2024-01-01",
            Freq::H1,
            Freq::D1,
            std::path::Path::new("demo_export"),
            &ExportOptions {
                metrics: MetricsSelection {
                    funding_rate: true,
                    open_interest: false,
                    open_interest_value: false,
                    long_short_ratio: Vec::new(),
                },
                ..ExportOptions::default()
            },
        )
        .await?;
    println!(
        "exported {} days x {} features to demo_export/",
        export_report.days.len(),
        export_report.features.len()
    );
    Ok(())
}
