//! Bar frequencies and their provider strings / millisecond strides.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported K-line frequencies.
///
/// Each value carries a provider-facing interval string and, where the
/// interval has a fixed length, a canonical millisecond stride. Calendar
/// months have no fixed stride; stride-dependent operations reject `Mo1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freq {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Freq {
    /// Provider-facing interval string (also the `freq` column value).
    pub fn as_str(&self) -> &'static str {
        match self {
            Freq::S1 => "1s",
            Freq::M1 => "1m",
            Freq::M3 => "3m",
            Freq::M5 => "5m",
            Freq::M15 => "15m",
            Freq::M30 => "30m",
            Freq::H1 => "1h",
            Freq::H2 => "2h",
            Freq::H4 => "4h",
            Freq::H6 => "6h",
            Freq::H8 => "8h",
            Freq::H12 => "12h",
            Freq::D1 => "1d",
            Freq::D3 => "3d",
            Freq::W1 => "1w",
            Freq::Mo1 => "1M",
        }
    }

    /// Canonical milliseconds per bar, when the interval has a fixed length.
    pub fn stride_ms(&self) -> Option<i64> {
        const SEC: i64 = 1_000;
        const MIN: i64 = 60 * SEC;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        match self {
            Freq::S1 => Some(SEC),
            Freq::M1 => Some(MIN),
            Freq::M3 => Some(3 * MIN),
            Freq::M5 => Some(5 * MIN),
            Freq::M15 => Some(15 * MIN),
            Freq::M30 => Some(30 * MIN),
            Freq::H1 => Some(HOUR),
            Freq::H2 => Some(2 * HOUR),
            Freq::H4 => Some(4 * HOUR),
            Freq::H6 => Some(6 * HOUR),
            Freq::H8 => Some(8 * HOUR),
            Freq::H12 => Some(12 * HOUR),
            Freq::D1 => Some(DAY),
            Freq::D3 => Some(3 * DAY),
            Freq::W1 => Some(7 * DAY),
            Freq::Mo1 => None,
        }
    }

    /// Nominal bars per UTC day, where the stride divides a day.
    pub fn bars_per_day(&self) -> Option<i64> {
        let stride = self.stride_ms()?;
        if stride <= 86_400_000 && 86_400_000 % stride == 0 {
            Some(86_400_000 / stride)
        } else {
            None
        }
    }

    pub fn all() -> &'static [Freq] {
        &[
            Freq::S1,
            Freq::M1,
            Freq::M3,
            Freq::M5,
            Freq::M15,
            Freq::M30,
            Freq::H1,
            Freq::H2,
            Freq::H4,
            Freq::H6,
            Freq::H8,
            Freq::H12,
            Freq::D1,
            Freq::D3,
            Freq::W1,
            Freq::Mo1,
        ]
    }
}

impl fmt::Display for Freq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Freq {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Freq::all()
            .iter()
            .find(|freq| freq.as_str() == s)
            .copied()
            .ok_or_else(|| format!("invalid frequency: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_provider_string() {
        for freq in Freq::all() {
            assert_eq!(freq.as_str().parse::<Freq>().unwrap(), *freq);
        }
        assert!("7m".parse::<Freq>().is_err());
    }

    #[test]
    fn strides_are_consistent() {
        assert_eq!(Freq::M1.stride_ms(), Some(60_000));
        assert_eq!(Freq::H1.stride_ms(), Some(3_600_000));
        assert_eq!(Freq::D1.stride_ms(), Some(86_400_000));
        assert_eq!(Freq::Mo1.stride_ms(), None);
    }

    #[test]
    fn bars_per_day_matches_export_expectations() {
        assert_eq!(Freq::D1.bars_per_day(), Some(1));
        assert_eq!(Freq::H1.bars_per_day(), Some(24));
        assert_eq!(Freq::M5.bars_per_day(), Some(288));
        assert_eq!(Freq::W1.bars_per_day(), None);
    }

    #[test]
    fn serde_uses_provider_string() {
        assert_eq!(serde_json::to_string(&Freq::H4).unwrap(), "\"4h\"");
        assert_eq!(serde_json::from_str::<Freq>("\"1M\"").unwrap(), Freq::Mo1);
    }
}
