//! Runtime configuration.
//!
//! Numerical defaults (rate-limit budgets, retry policy, pool sizes) are
//! config, not code: a TOML file passed with `--config` overrides them,
//! credentials come from the environment.
//!
//! ```toml
//! [limiters.futures]
//! base_delay_ms = 300
//! max_requests_per_minute = 1800
//!
//! [retry]
//! max_retries = 5
//!
//! [download]
//! pool_size = 8
//! ```

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::throttle::{EndpointLimiters, LimiterSettings, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    pub spot: LimiterSettings,
    pub futures: LimiterSettings,
    pub heavy: LimiterSettings,
    pub batch: LimiterSettings,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            spot: LimiterSettings::new(600, 1200),
            futures: LimiterSettings::new(300, 1800),
            heavy: LimiterSettings::new(1000, 600),
            batch: LimiterSettings::new(800, 1000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub pool_size: usize,
    pub max_rounds: u32,
    pub completeness_threshold: f64,
    pub db_pool_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_rounds: 3,
            completeness_threshold: 0.95,
            db_pool_size: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limiters: LimiterConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            PipelineError::Config(format!("malformed config file {}: {e}", path.display()))
        })?;
        Ok(config)
    }

    pub fn endpoint_limiters(&self) -> EndpointLimiters {
        EndpointLimiters::new(
            self.limiters.spot,
            self.limiters.futures,
            self.limiters.heavy,
            self.limiters.batch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = Config::default();
        assert_eq!(config.limiters.futures.base_delay_ms, 300);
        assert_eq!(config.limiters.futures.max_requests_per_minute, 1800);
        assert_eq!(config.limiters.heavy.max_requests_per_minute, 600);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.download.pool_size, 4);
    }

    #[test]
    fn toml_overrides_are_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[limiters]
spot = {{ base_delay_ms = 600, max_requests_per_minute = 1200 }}
futures = {{ base_delay_ms = 100, max_requests_per_minute = 2400 }}
heavy = {{ base_delay_ms = 1000, max_requests_per_minute = 600 }}
batch = {{ base_delay_ms = 800, max_requests_per_minute = 1000 }}

[retry]
max_retries = 7

[download]
pool_size = 8
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.limiters.futures.max_requests_per_minute, 2400);
        assert_eq!(config.retry.max_retries, 7);
        // Unspecified retry fields keep their defaults.
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.download.pool_size, 8);
        assert_eq!(config.download.max_rounds, 3);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(err.to_string().contains("config"));
    }
}
