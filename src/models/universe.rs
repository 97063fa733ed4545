//! Point-in-time instrument universes.
//!
//! A universe is re-selected at each rebalance date from data strictly
//! before it. The temporal relations that make backtests sound are enforced
//! at construction: a snapshot whose selection window touches its usage
//! window cannot be built.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time;

/// Immutable plan inputs for a universe definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub start_date: String,
    pub end_date: String,
    pub t1_months: u32,
    pub t2_months: u32,
    pub t3_months: u32,
    pub delay_days: u32,
    pub quote_asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ratio: Option<f64>,
}

impl UniverseConfig {
    pub fn validate(&self) -> Result<()> {
        match (self.top_k, self.top_ratio) {
            (Some(_), Some(_)) => bail!("top_k and top_ratio are mutually exclusive"),
            (None, None) => bail!("one of top_k or top_ratio is required"),
            (Some(0), _) => bail!("top_k must be positive"),
            (_, Some(r)) if !(0.0..=1.0).contains(&r) => {
                bail!("top_ratio must be within [0, 1], got {r}")
            }
            _ => {}
        }
        if self.t1_months == 0 || self.t2_months == 0 {
            bail!("t1_months and t2_months must be positive");
        }
        if time::parse_date(&self.end_date)? < time::parse_date(&self.start_date)? {
            bail!("end_date precedes start_date");
        }
        Ok(())
    }

    /// File stem encoding the full parameter tuple, used for the default
    /// universe file name.
    pub fn file_stem(&self) -> String {
        let selection = match (self.top_k, self.top_ratio) {
            (Some(k), _) => format!("k{k}"),
            (_, Some(r)) => format!("r{r}"),
            _ => "all".to_string(),
        };
        format!(
            "universe_{}_{}_{}_{}_{}_{}",
            self.start_date, self.end_date, self.t1_months, self.t2_months, self.t3_months, selection
        )
    }
}

/// One rebalance point: the selected symbols, their turnover, and the dates
/// that make the selection auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseSnapshot {
    pub effective_date: String,
    pub calculated_t1_start: String,
    pub calculated_t1_end: String,
    pub start_date: String,
    pub end_date: String,
    pub symbols: Vec<String>,
    pub mean_daily_amounts: BTreeMap<String, f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl UniverseSnapshot {
    /// Build a snapshot for a rebalance at `effective_date`, deriving the
    /// selection window from `delay_days`/`t1_months` and the usage window
    /// from `t1_months` capped at `plan_end_date`. Fails if the derived
    /// dates violate the temporal relations.
    #[allow(clippy::too_many_arguments)]
    pub fn for_rebalance(
        effective_date: &str,
        plan_end_date: &str,
        t1_months: u32,
        delay_days: u32,
        symbols: Vec<String>,
        mean_daily_amounts: BTreeMap<String, f64>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Self> {
        let calculated_t1_end = time::add_days(effective_date, -(delay_days as i64))?;
        let calculated_t1_start = time::subtract_months(&calculated_t1_end, t1_months)?;
        // Usage starts strictly after the rebalance point.
        let start_date = time::add_days(effective_date, 1)?;
        let nominal_end = time::add_months(effective_date, t1_months)?;
        let end_date = if time::parse_date(plan_end_date)? < time::parse_date(&nominal_end)? {
            plan_end_date.to_string()
        } else {
            nominal_end
        };

        let snapshot = Self {
            effective_date: time::standardize_date(effective_date)?,
            calculated_t1_start,
            calculated_t1_end,
            start_date,
            end_date,
            symbols,
            mean_daily_amounts,
            metadata,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// The temporal relations every snapshot must satisfy:
    /// selection uses only data known at the rebalance point, and the
    /// universe is used strictly after it.
    pub fn validate(&self) -> Result<()> {
        let t1_end = time::parse_date(&self.calculated_t1_end)?;
        let t1_start = time::parse_date(&self.calculated_t1_start)?;
        let effective = time::parse_date(&self.effective_date)?;
        let start = time::parse_date(&self.start_date)?;
        let end = time::parse_date(&self.end_date)?;

        if t1_start > t1_end {
            bail!(
                "snapshot {}: selection window is inverted ({} > {})",
                self.effective_date,
                self.calculated_t1_start,
                self.calculated_t1_end
            );
        }
        if t1_end > effective {
            bail!(
                "snapshot {}: selection window ends after the rebalance point ({})",
                self.effective_date,
                self.calculated_t1_end
            );
        }
        if start <= effective {
            bail!(
                "snapshot {}: usage window starts at or before the rebalance point ({})",
                self.effective_date,
                self.start_date
            );
        }
        if end < start {
            bail!(
                "snapshot {}: usage window is inverted ({} > {})",
                self.effective_date,
                self.start_date,
                self.end_date
            );
        }
        Ok(())
    }
}

/// A full universe plan: config, the snapshot sequence, and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseDefinition {
    pub config: UniverseConfig,
    pub snapshots: Vec<UniverseSnapshot>,
    pub creation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl UniverseDefinition {
    pub fn new(
        config: UniverseConfig,
        snapshots: Vec<UniverseSnapshot>,
        description: Option<String>,
    ) -> Result<Self> {
        let def = Self {
            config,
            snapshots,
            creation_time: Utc::now(),
            description,
        };
        def.validate()?;
        Ok(def)
    }

    /// Validate the config, every snapshot, and the cross-snapshot coverage
    /// rule: consecutive usage windows may not leave a gap of more than one
    /// day (a one-day overlap at month boundaries is fine).
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        for snapshot in &self.snapshots {
            snapshot.validate()?;
        }
        for pair in self.snapshots.windows(2) {
            let prev_end = time::parse_date(&pair[0].end_date)?;
            let next_start = time::parse_date(&pair[1].start_date)?;
            if next_start < prev_end.pred_opt().context("date underflow")? {
                bail!(
                    "coverage gap between snapshots {} and {}: {} starts before {} - 1 day",
                    pair[0].effective_date,
                    pair[1].effective_date,
                    pair[1].start_date,
                    pair[0].end_date
                );
            }
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read universe file {}", path.display()))?;
        let def: Self = serde_json::from_str(&raw)
            .with_context(|| format!("malformed universe file {}", path.display()))?;
        def.validate()?;
        Ok(def)
    }

    /// All distinct symbols across snapshots, sorted.
    pub fn all_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .snapshots
            .iter()
            .flat_map(|s| s.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}
