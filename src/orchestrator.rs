//! Binds universe -> ingest -> export into single runs.
//!
//! Downloads proceed snapshot by snapshot: the K-line window first, then
//! the requested metric families. Per-symbol failures stay inside the
//! snapshot reports; only CRITICAL conditions (bad credentials, a broken
//! store) abort the run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::client::ExchangeClient;
use crate::export::{ExportOptions, ExportReport, NumpyExporter};
use crate::ingest::{
    KlineDownloadOptions, KlineDownloader, MetricsDownloadOptions, MetricsDownloader,
    VisionDownloader,
};
use crate::models::{Freq, IntegrityReport, RatioType, UniverseDefinition};
use crate::storage::MarketStore;
use crate::throttle::{EndpointLimiters, RetryConfig};

#[derive(Debug, Clone)]
pub struct DownloadRunOptions {
    pub klines_freq: Freq,
    /// Open-interest sampling period.
    pub metrics_freq: Freq,
    pub lsr_period: String,
    pub lsr_types: Vec<RatioType>,
    pub pool_size: usize,
    pub max_rounds: u32,
    pub completeness_threshold: f64,
    pub retry: RetryConfig,
    pub include_metrics: bool,
    /// Fetch OI/LSR history from daily bulk archives instead of the
    /// 30-day-limited API endpoints.
    pub use_bulk_vision: bool,
}

impl Default for DownloadRunOptions {
    fn default() -> Self {
        Self {
            klines_freq: Freq::M1,
            metrics_freq: Freq::M5,
            lsr_period: "5m".to_string(),
            lsr_types: RatioType::all().to_vec(),
            pool_size: 4,
            max_rounds: 3,
            completeness_threshold: 0.95,
            retry: RetryConfig::default(),
            include_metrics: true,
            use_bulk_vision: false,
        }
    }
}

/// Per-snapshot outcome of a download run.
#[derive(Debug, Clone)]
pub struct SnapshotRunReport {
    pub effective_date: String,
    pub klines: IntegrityReport,
    /// `(what, report)` per metric family run.
    pub metrics: Vec<(String, IntegrityReport)>,
}

impl SnapshotRunReport {
    pub fn is_complete(&self) -> bool {
        self.klines.is_complete() && self.metrics.iter().all(|(_, r)| r.is_complete())
    }
}

pub struct Orchestrator {
    client: Arc<dyn ExchangeClient>,
    store: MarketStore,
    limiters: Arc<EndpointLimiters>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: MarketStore,
        limiters: Arc<EndpointLimiters>,
    ) -> Self {
        Self {
            client,
            store,
            limiters,
        }
    }

    pub fn store(&self) -> &MarketStore {
        &self.store
    }

    /// Download every snapshot's usage window from a universe file.
    pub async fn download_universe_data(
        &self,
        universe_file: &Path,
        opts: &DownloadRunOptions,
    ) -> Result<Vec<SnapshotRunReport>> {
        let definition = UniverseDefinition::load_from_file(universe_file)?;
        info!(
            "universe download: {} snapshots from {}",
            definition.snapshots.len(),
            universe_file.display()
        );

        let kline_downloader = KlineDownloader::new(
            Arc::clone(&self.client),
            self.store.clone(),
            Arc::clone(&self.limiters),
        );
        let metrics_downloader = MetricsDownloader::new(
            Arc::clone(&self.client),
            self.store.clone(),
            Arc::clone(&self.limiters),
        );

        let kline_opts = KlineDownloadOptions {
            completeness_threshold: opts.completeness_threshold,
            max_rounds: opts.max_rounds,
            pool_size: opts.pool_size,
            retry: opts.retry,
            ..KlineDownloadOptions::default()
        };
        let metric_opts = MetricsDownloadOptions {
            pool_size: opts.pool_size,
            retry: opts.retry,
            ..MetricsDownloadOptions::default()
        };

        let mut reports = Vec::with_capacity(definition.snapshots.len());
        for (i, snapshot) in definition.snapshots.iter().enumerate() {
            info!(
                "snapshot {}/{}: {} ({} symbols, {}..{})",
                i + 1,
                definition.snapshots.len(),
                snapshot.effective_date,
                snapshot.symbols.len(),
                snapshot.start_date,
                snapshot.end_date
            );

            let klines = kline_downloader
                .download_klines(
                    &snapshot.symbols,
                    &snapshot.start_date,
                    &snapshot.end_date,
                    opts.klines_freq,
                    &kline_opts,
                )
                .await
                .with_context(|| format!("snapshot {} kline download", snapshot.effective_date))?;
            if !klines.is_complete() {
                warn!(
                    "snapshot {}: {} symbols failed",
                    snapshot.effective_date,
                    klines.failed_symbols.len()
                );
            }

            let mut metrics = Vec::new();
            if opts.include_metrics {
                let funding = metrics_downloader
                    .download_funding_rates(
                        &snapshot.symbols,
                        &snapshot.start_date,
                        &snapshot.end_date,
                        &metric_opts,
                    )
                    .await?;
                metrics.push(("funding_rate".to_string(), funding));

                if opts.use_bulk_vision {
                    let vision =
                        VisionDownloader::new(self.store.clone(), Arc::clone(&self.limiters));
                    let report = vision
                        .download_metrics(
                            &snapshot.symbols,
                            &snapshot.start_date,
                            &snapshot.end_date,
                            opts.retry,
                        )
                        .await?;
                    metrics.push(("vision_metrics".to_string(), report));
                } else {
                    let oi = metrics_downloader
                        .download_open_interest(
                            &snapshot.symbols,
                            &snapshot.start_date,
                            &snapshot.end_date,
                            opts.metrics_freq,
                            &metric_opts,
                        )
                        .await?;
                    metrics.push(("open_interest".to_string(), oi));

                    for ratio_type in &opts.lsr_types {
                        let report = metrics_downloader
                            .download_long_short_ratio(
                                &snapshot.symbols,
                                &snapshot.start_date,
                                &snapshot.end_date,
                                &opts.lsr_period,
                                *ratio_type,
                                &metric_opts,
                            )
                            .await?;
                        metrics.push((ratio_type.as_str().to_string(), report));
                    }
                }
            }

            reports.push(SnapshotRunReport {
                effective_date: snapshot.effective_date.clone(),
                klines,
                metrics,
            });
        }

        let incomplete = reports.iter().filter(|r| !r.is_complete()).count();
        if incomplete > 0 {
            warn!("{incomplete} snapshots finished with failures");
        } else {
            info!("all snapshots downloaded cleanly");
        }
        Ok(reports)
    }

    /// Export every snapshot's usage window as per-day matrices.
    #[allow(clippy::too_many_arguments)]
    pub async fn export_universe_data(
        &self,
        universe_file: &Path,
        output_dir: &Path,
        source_freq: Freq,
        export_freq: Freq,
        export_opts: &ExportOptions,
    ) -> Result<Vec<ExportReport>> {
        let definition = UniverseDefinition::load_from_file(universe_file)?;
        let exporter = NumpyExporter::new(self.store.clone());

        let mut reports = Vec::with_capacity(definition.snapshots.len());
        for snapshot in &definition.snapshots {
            info!(
                "export snapshot {} ({}..{})",
                snapshot.effective_date, snapshot.start_date, snapshot.end_date
            );
            let report = exporter
                .export_combined(
                    &snapshot.symbols,
                    &snapshot.start_date,
                    &snapshot.end_date,
                    source_freq,
                    export_freq,
                    output_dir,
                    export_opts,
                )
                .await
                .with_context(|| format!("snapshot {} export", snapshot.effective_date))?;
            reports.push(report);
        }
        Ok(reports)
    }
}
