//! marketpipe CLI: plan a universe, download its data, export matrices.
//!
//! Exit codes: 0 success, 1 user/config error, 2 runtime failure without
//! data loss, 3 runtime failure with partial data written (details in the
//! logs).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketpipe::client::BinanceClient;
use marketpipe::config::Config;
use marketpipe::error::PipelineError;
use marketpipe::export::{ExportOptions, MetricsSelection};
use marketpipe::models::{Freq, RatioType, UniverseConfig};
use marketpipe::orchestrator::{DownloadRunOptions, Orchestrator};
use marketpipe::storage::MarketStore;
use marketpipe::universe::{PlannerOptions, UniversePlanner};

#[derive(Parser, Debug)]
#[command(name = "marketpipe")]
#[command(about = "Perpetual-futures market data pipeline: universe planning, ingestion, export")]
struct Cli {
    /// Optional TOML config file (rate limits, retry policy, pool sizes).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider API key; keyed requests get larger rate budgets.
    #[arg(long, env = "BINANCE_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Provider API secret. Accepted for parity with the provider contract;
    /// public market-data endpoints do not require signing.
    #[arg(long, env = "BINANCE_API_SECRET", global = true, hide_env_values = true)]
    api_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Select the top-K instruments at each rebalance and write the plan.
    PlanUniverse {
        /// Output file (or directory; the name then encodes the parameters).
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Lookback window length in months for turnover.
        #[arg(long)]
        t1: u32,
        /// Rebalance spacing in months.
        #[arg(long)]
        t2: u32,
        /// Minimum contract age in months at selection time.
        #[arg(long)]
        t3: u32,
        #[arg(long, conflicts_with = "top_ratio")]
        top_k: Option<usize>,
        #[arg(long, conflicts_with = "top_k")]
        top_ratio: Option<f64>,
        #[arg(long, default_value = "USDT")]
        quote: String,
        /// Data-availability buffer before each rebalance date.
        #[arg(long, default_value_t = 7)]
        delay_days: u32,
        #[arg(long)]
        description: Option<String>,
    },

    /// Download every snapshot window of a universe into the database.
    Download {
        #[arg(long)]
        universe: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value = "1m")]
        freq: Freq,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Seconds between requests on the futures endpoints.
        #[arg(long)]
        request_delay: Option<f64>,
        /// Also download funding rate / open interest / long-short ratios.
        #[arg(long, default_value = "on")]
        metrics: OnOff,
        /// Open-interest sampling period.
        #[arg(long, default_value = "5m")]
        metrics_freq: Freq,
        #[arg(long, default_value = "5m")]
        lsr_period: String,
        /// Ratio series to download (comma-separated:
        /// toptrader_account,toptrader_position,global_account,taker_vol).
        #[arg(long, value_delimiter = ',')]
        lsr_types: Option<Vec<String>>,
        /// Fetch OI/LSR history from daily bulk archives instead of the
        /// 30-day-limited API.
        #[arg(long)]
        use_vision: bool,
    },

    /// Export snapshot windows as per-day NumPy matrices.
    Export {
        #[arg(long)]
        universe: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        source_freq: Freq,
        #[arg(long)]
        export_freq: Freq,
        #[arg(long, default_value = "on")]
        klines: OnOff,
        #[arg(long, default_value = "on")]
        metrics: OnOff,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OnOff {
    On,
    Off,
}

impl OnOff {
    fn enabled(self) -> bool {
        self == OnOff::On
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketpipe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::Config(_)) | Some(PipelineError::InvalidInput(_)) => {
                    ExitCode::from(1)
                }
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let client = Arc::new(BinanceClient::new(cli.api_key.clone()));
    let limiters = Arc::new(config.endpoint_limiters());

    match cli.command {
        Commands::PlanUniverse {
            out,
            start,
            end,
            t1,
            t2,
            t3,
            top_k,
            top_ratio,
            quote,
            delay_days,
            description,
        } => {
            let universe_config = UniverseConfig {
                start_date: start,
                end_date: end,
                t1_months: t1,
                t2_months: t2,
                t3_months: t3,
                delay_days,
                quote_asset: quote,
                top_k,
                top_ratio,
            };
            universe_config
                .validate()
                .map_err(|e| PipelineError::Config(e.to_string()))?;

            let planner = UniversePlanner::new(client, limiters);
            let opts = PlannerOptions {
                retry: config.retry,
                ..PlannerOptions::default()
            };
            let (definition, path) = planner
                .define_universe(&universe_config, &out, description, &opts)
                .await?;
            info!(
                "universe plan with {} snapshots written to {}",
                definition.snapshots.len(),
                path.display()
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Download {
            universe,
            db,
            freq,
            workers,
            request_delay,
            metrics,
            metrics_freq,
            lsr_period,
            lsr_types,
            use_vision,
        } => {
            let mut limiter_config = config.limiters.clone();
            if let Some(delay) = request_delay {
                limiter_config.futures.base_delay_ms = (delay * 1000.0) as u64;
            }
            let limiters = Arc::new(marketpipe::throttle::EndpointLimiters::new(
                limiter_config.spot,
                limiter_config.futures,
                limiter_config.heavy,
                limiter_config.batch,
            ));

            let lsr_types = parse_lsr_types(lsr_types)?;
            let store = MarketStore::open(&db, config.download.db_pool_size)
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            let orchestrator = Orchestrator::new(client, store, limiters);

            let opts = DownloadRunOptions {
                klines_freq: freq,
                metrics_freq,
                lsr_period,
                lsr_types,
                pool_size: workers,
                max_rounds: config.download.max_rounds,
                completeness_threshold: config.download.completeness_threshold,
                retry: config.retry,
                include_metrics: metrics.enabled(),
                use_bulk_vision: use_vision,
            };
            let reports = orchestrator.download_universe_data(&universe, &opts).await?;

            let incomplete = reports.iter().filter(|r| !r.is_complete()).count();
            if incomplete > 0 {
                warn!(
                    "{incomplete}/{} snapshots have failed symbols; partial data was written",
                    reports.len()
                );
                return Ok(ExitCode::from(3));
            }
            info!("download complete: {} snapshots", reports.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Export {
            universe,
            db,
            out,
            source_freq,
            export_freq,
            klines,
            metrics,
        } => {
            let store = MarketStore::open(&db, config.download.db_pool_size)
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            let orchestrator = Orchestrator::new(client, store, limiters);

            let export_opts = ExportOptions {
                include_klines: klines.enabled(),
                include_metrics: metrics.enabled(),
                metrics: if metrics.enabled() {
                    MetricsSelection::default()
                } else {
                    MetricsSelection::none()
                },
                field_mapping: None,
            };
            let reports = orchestrator
                .export_universe_data(&universe, &out, source_freq, export_freq, &export_opts)
                .await?;
            let days: usize = reports.iter().map(|r| r.days.len()).sum();
            info!("export complete: {} snapshots, {days} day files", reports.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_lsr_types(raw: Option<Vec<String>>) -> Result<Vec<RatioType>> {
    match raw {
        None => Ok(RatioType::all().to_vec()),
        Some(values) => values
            .iter()
            .map(|v| {
                RatioType::parse(v.trim())
                    .map_err(|e| PipelineError::Config(e.to_string()).into())
            })
            .collect(),
    }
}
