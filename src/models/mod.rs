//! Domain types shared across the pipeline.

mod freq;
mod records;
mod report;
pub mod universe;

pub use freq::Freq;
pub use records::{
    value_f64, value_i64, FundingRate, LongShortRatio, OpenInterest, PerpKline, RatioType,
    RawKlineRow,
};
pub use report::{IntegrityReport, MissingPeriod};
pub use universe::{UniverseConfig, UniverseDefinition, UniverseSnapshot};
