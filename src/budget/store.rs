//! Usage-log persistence and budget-config loading.
//!
//! Usage records land in one append-only JSON array per UTC day under
//! `<home>/usage/<YYYY-MM-DD>.json`. Every write goes through a temp file
//! and rename so a crash never leaves a truncated log.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{BudgetError, BudgetResult, UsageRecord};

/// Budget limits for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetLimits {
    pub daily_limit: Option<f64>,
    pub weekly_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub max_tokens_per_task: Option<u64>,
    pub warning_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_limit: None,
            weekly_limit: None,
            monthly_limit: None,
            max_tokens_per_task: None,
            warning_threshold: 0.8,
        }
    }
}

/// On-disk budget configuration: `budgets.json` or `budgets.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BudgetBook {
    pub global: Option<BudgetLimits>,
    pub projects: HashMap<String, BudgetLimits>,
    pub agents: HashMap<String, BudgetLimits>,
}

impl BudgetBook {
    /// Load from the agentmux home. Missing files yield an empty book,
    /// malformed files a warning plus the empty book.
    pub fn load(home: &Path) -> Self {
        for name in ["budgets.json", "budgets.yaml"] {
            let path = home.join(name);
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let parsed: Result<BudgetBook, String> = if name.ends_with(".json") {
                serde_json::from_str(&raw).map_err(|e| e.to_string())
            } else {
                serde_yaml::from_str(&raw).map_err(|e| e.to_string())
            };
            match parsed {
                Ok(book) => return book,
                Err(e) => warn!("ignoring malformed budget file {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Scope lookup order: agent, then project, then global, then defaults.
    pub fn for_scope(&self, scope_id: &str) -> BudgetLimits {
        if let Some(cfg) = self.agents.get(scope_id) {
            return cfg.clone();
        }
        if let Some(cfg) = self.projects.get(scope_id) {
            return cfg.clone();
        }
        self.global.clone().unwrap_or_default()
    }
}

/// Append-only, per-UTC-day usage log.
pub struct UsageStore {
    usage_dir: PathBuf,
}

impl UsageStore {
    pub fn new(home: &Path) -> Self {
        Self {
            usage_dir: home.join("usage"),
        }
    }

    pub fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.usage_dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    /// Append one record to its day file atomically.
    pub fn append(&self, record: &UsageRecord) -> BudgetResult<()> {
        std::fs::create_dir_all(&self.usage_dir)?;
        let path = self.day_path(record.timestamp.date_naive());
        let mut records = self.read_day_file(&path);
        records.push(record.clone());

        let mut tmp = tempfile::NamedTempFile::new_in(&self.usage_dir)?;
        serde_json::to_writer_pretty(&mut tmp, &records)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| BudgetError::Io(e.error))?;
        Ok(())
    }

    /// Records for one UTC day. Missing files are empty days; malformed
    /// files are warned about and treated as empty.
    pub fn load_day(&self, date: NaiveDate) -> Vec<UsageRecord> {
        self.read_day_file(&self.day_path(date))
    }

    /// Records across a date range, inclusive.
    pub fn load_range(&self, from: NaiveDate, to: NaiveDate) -> Vec<UsageRecord> {
        let mut records = Vec::new();
        let mut date = from;
        while date <= to {
            records.extend(self.load_day(date));
            date = date.succ_opt().expect("date range within calendar bounds");
        }
        records
    }

    fn read_day_file(&self, path: &Path) -> Vec<UsageRecord> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!("ignoring malformed usage log {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}
