//! Download integrity reporting.

use serde::{Deserialize, Serialize};

/// A symbol/period the downloader could not fill, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPeriod {
    pub symbol: String,
    pub period: String,
    pub reason: String,
}

/// Outcome of a batch download run.
///
/// `data_quality_score` starts at `successful / total` and is penalised by
/// the sampled completeness check (at most 30%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total_symbols: usize,
    pub successful_symbols: usize,
    pub failed_symbols: Vec<String>,
    pub missing_periods: Vec<MissingPeriod>,
    pub data_quality_score: f64,
    pub recommendations: Vec<String>,
}

impl IntegrityReport {
    /// Report for a run with nothing to do.
    pub fn empty() -> Self {
        Self {
            total_symbols: 0,
            successful_symbols: 0,
            failed_symbols: Vec::new(),
            missing_periods: Vec::new(),
            data_quality_score: 1.0,
            recommendations: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_perfect() {
        let report = IntegrityReport::empty();
        assert_eq!(report.total_symbols, 0);
        assert_eq!(report.data_quality_score, 1.0);
        assert!(report.is_complete());
    }
}
