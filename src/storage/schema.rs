//! Database schema.
//!
//! One statement batch, applied idempotently on every fresh connection.
//! `market_data` keeps `close_time` as a queryable column even though
//! exports only surface it inside the timestamp cube.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS market_data (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    freq TEXT NOT NULL,
    open_price REAL,
    high_price REAL,
    low_price REAL,
    close_price REAL,
    volume REAL,
    quote_volume REAL,
    trades_count INTEGER,
    taker_buy_volume REAL,
    taker_buy_quote_volume REAL,
    taker_sell_volume REAL,
    taker_sell_quote_volume REAL,
    close_time INTEGER,
    PRIMARY KEY (symbol, timestamp, freq)
);

CREATE TABLE IF NOT EXISTS funding_rate (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    funding_rate REAL,
    funding_time INTEGER,
    mark_price REAL,
    index_price REAL,
    PRIMARY KEY (symbol, timestamp)
);

CREATE TABLE IF NOT EXISTS open_interest (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    interval TEXT NOT NULL,
    open_interest REAL,
    open_interest_value REAL,
    PRIMARY KEY (symbol, timestamp, interval)
);

CREATE TABLE IF NOT EXISTS long_short_ratio (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    period TEXT NOT NULL,
    ratio_type TEXT NOT NULL,
    long_short_ratio REAL,
    long_account REAL,
    short_account REAL,
    PRIMARY KEY (symbol, timestamp, period, ratio_type)
);

CREATE INDEX IF NOT EXISTS idx_market_symbol ON market_data(symbol);
CREATE INDEX IF NOT EXISTS idx_market_timestamp ON market_data(timestamp);
CREATE INDEX IF NOT EXISTS idx_market_freq ON market_data(freq);
CREATE INDEX IF NOT EXISTS idx_market_symbol_freq_timestamp
    ON market_data(symbol, freq, timestamp);

CREATE INDEX IF NOT EXISTS idx_funding_symbol ON funding_rate(symbol);
CREATE INDEX IF NOT EXISTS idx_funding_timestamp ON funding_rate(timestamp);
CREATE INDEX IF NOT EXISTS idx_oi_symbol ON open_interest(symbol);
CREATE INDEX IF NOT EXISTS idx_oi_timestamp ON open_interest(timestamp);
CREATE INDEX IF NOT EXISTS idx_lsr_symbol ON long_short_ratio(symbol);
CREATE INDEX IF NOT EXISTS idx_lsr_timestamp ON long_short_ratio(timestamp);
"#;

/// Per-connection engine pragmas. WAL lets readers proceed while a writer
/// holds the log; the cache/mmap sizes match a multi-GB K-line database.
pub const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -10000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;
PRAGMA foreign_keys = ON;
"#;
