//! marketpipe — crypto-derivatives market-data pipeline.
//!
//! Ingests perpetual-futures K-lines and derived metrics (funding rate,
//! open interest, long/short ratio) from a rate-limited provider, stores
//! them in a single-file SQLite database, and exports time-aligned
//! symbol x time matrices as `.npy` files for quantitative research.
//!
//! The moving parts, in data-flow order:
//! - [`universe`]: point-in-time top-K instrument selection with strict
//!   no-lookahead temporal relations
//! - [`ingest`]: throttled concurrent downloaders with idempotent writes
//! - [`storage`]: the SQLite schema, connection pool, and typed queries
//! - [`frame`]: `(symbol, timestamp)` tables, OHLCV resampling, and as-of
//!   alignment
//! - [`export`]: per-day `K x T` matrices, the timestamp cube, and the
//!   day->symbol-order index
//! - [`orchestrator`]: one-call universe -> ingest -> export runs

pub mod client;
pub mod config;
pub mod error;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod storage;
pub mod throttle;
pub mod time;
pub mod universe;

pub use client::{BinanceClient, ClientError, ExchangeClient, Market};
pub use config::Config;
pub use error::PipelineError;
pub use export::{ExportOptions, MetricsSelection, NumpyExporter};
pub use frame::Frame;
pub use models::{Freq, IntegrityReport, RatioType, UniverseDefinition};
pub use orchestrator::{DownloadRunOptions, Orchestrator, SnapshotRunReport};
pub use storage::MarketStore;
pub use universe::{PlannerOptions, UniversePlanner};
