//! Durable storage: single-file SQLite behind a fixed-size connection pool.

mod pool;
mod query;
mod schema;
mod store;

pub use pool::{ConnectionPool, PooledConn};
pub use query::KLINE_FEATURES;
pub use store::{DataSummary, MarketStore, TableSummary};
