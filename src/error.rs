//! Typed failures the orchestrator and CLI branch on.

use std::fmt;

/// Failure kinds that cross component boundaries. Recoverable conditions
/// (rate limits, transient network errors, row validation) are handled
/// inside the components; what escapes is one of these.
#[derive(Debug)]
pub enum PipelineError {
    /// Invalid CLI arguments or config file. Exit code 1.
    Config(String),
    /// Provider rejected the credentials. Aborts the run.
    Auth(String),
    /// Bad symbol or frequency in a request.
    InvalidInput(String),
    /// Database constraint or I/O failure that survived a retry.
    Storage(String),
    /// Export requested at a frequency with no stored rows.
    MissingSource(String),
    /// A strict read found no rows.
    NoData(String),
    /// Operator cancellation or overall-budget timeout.
    Cancelled(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Auth(msg) => write!(f, "authentication failure: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Storage(msg) => write!(f, "storage failure: {msg}"),
            Self::MissingSource(msg) => write!(f, "missing source data: {msg}"),
            Self::NoData(msg) => write!(f, "no data: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}
