//! Token-spend metering against configured budgets.
//!
//! Every usage record is costed, durably appended to the per-day log, and
//! rolled into in-memory period aggregates. Threshold alerts are
//! edge-triggered: each `(scope, scopeId, period)` bucket fires its warning
//! and its exceeded alert at most once per crossing, no matter how records
//! interleave.

pub mod rates;
pub mod store;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::events::{Event, EventBus, EventKind};

pub use store::{BudgetBook, BudgetLimits, UsageStore};

const APPEND_RETRIES: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(50);

/// Error types for budget operations.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("usage log IO failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("usage append gave up after {attempts} attempts: {last_error}")]
    AppendRetriesExhausted { attempts: u32, last_error: String },
}

pub type BudgetResult<T> = std::result::Result<T, BudgetError>;

/// One metered LLM interaction. Append-only; never mutated after recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub agent_id: String,
    pub session_name: String,
    pub project_path: String,
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub estimated_cost: f64,
}

/// Aggregation periods, UTC-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Day,
    Week,
    Month,
}

impl BudgetPeriod {
    /// Stable bucket key for the period containing `date`.
    pub fn bucket_key(&self, date: NaiveDate) -> String {
        match self {
            BudgetPeriod::Day => date.format("%Y-%m-%d").to_string(),
            BudgetPeriod::Week => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            BudgetPeriod::Month => date.format("%Y-%m").to_string(),
        }
    }

    /// Inclusive date range of the period containing `date`.
    pub fn range(&self, date: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            BudgetPeriod::Day => (date, date),
            BudgetPeriod::Week => {
                let week = date.week(Weekday::Mon);
                (week.first_day(), week.last_day())
            }
            BudgetPeriod::Month => {
                let first = date.with_day(1).expect("first of month");
                let last = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                }
                .expect("first of next month")
                .pred_opt()
                .expect("last of month");
                (first, last)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScopeKind {
    Agent,
    Project,
    Global,
}

impl ScopeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Agent => "agent",
            ScopeKind::Project => "project",
            ScopeKind::Global => "global",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    scope: ScopeKind,
    scope_id: String,
    period: BudgetPeriod,
    bucket: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AlertStage {
    Warned,
    Exceeded,
}

#[derive(Default)]
struct MeterState {
    spend: HashMap<BucketKey, f64>,
    alerted: HashMap<BucketKey, AlertStage>,
}

/// Token/cost totals with per-operation and per-model breakdowns.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub by_operation: HashMap<String, SliceUsage>,
    pub by_model: HashMap<String, SliceUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceUsage {
    pub tokens: u64,
    pub estimated_cost: f64,
}

impl UsageSummary {
    fn add(&mut self, record: &UsageRecord) {
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.estimated_cost += record.estimated_cost;
        let tokens = record.input_tokens + record.output_tokens;
        let op = self.by_operation.entry(record.operation.clone()).or_default();
        op.tokens += tokens;
        op.estimated_cost += record.estimated_cost;
        let model = self.by_model.entry(record.model.clone()).or_default();
        model.tokens += tokens;
        model.estimated_cost += record.estimated_cost;
    }
}

/// Per-agent usage report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub period: BudgetPeriod,
    pub agents: HashMap<String, UsageSummary>,
    pub total: UsageSummary,
}

/// Filters for [`BudgetMeter::generate_report`].
#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    pub period: Option<BudgetPeriod>,
    pub project_path: Option<String>,
    pub agent_id: Option<String>,
}

pub struct BudgetMeter {
    store: UsageStore,
    book: BudgetBook,
    events: EventBus,
    state: Mutex<MeterState>,
}

impl BudgetMeter {
    pub fn new(home: &Path, events: EventBus) -> Self {
        Self {
            store: UsageStore::new(home),
            book: BudgetBook::load(home),
            events,
            state: Mutex::new(MeterState::default()),
        }
    }

    #[cfg(test)]
    pub fn with_book(home: &Path, events: EventBus, book: BudgetBook) -> Self {
        Self {
            store: UsageStore::new(home),
            book,
            events,
            state: Mutex::new(MeterState::default()),
        }
    }

    /// Cost, durably append, and evaluate alerts for one record.
    pub async fn record_usage(&self, mut record: UsageRecord) -> BudgetResult<()> {
        record.estimated_cost =
            rates::calculate_cost(record.input_tokens, record.output_tokens, &record.model);

        let mut state = self.state.lock().await;
        let watched = self.watched_buckets(&record);
        // Seed aggregates from disk before the append so the new record is
        // not double counted.
        let record_date = record.timestamp.date_naive();
        for (key, _, _) in &watched {
            if !state.spend.contains_key(key) {
                let seeded = self.sum_from_disk(key, record_date);
                state.spend.insert(key.clone(), seeded);
            }
        }

        self.append_with_retry(&record).await?;

        for (key, limit, warning_threshold) in watched {
            let old = *state.spend.get(&key).unwrap_or(&0.0);
            let new = old + record.estimated_cost;
            state.spend.insert(key.clone(), new);

            let warn_line = warning_threshold * limit;
            let stage = state.alerted.get(&key).copied();
            if old < warn_line && new >= warn_line && stage.is_none() {
                state.alerted.insert(key.clone(), AlertStage::Warned);
                self.publish_alert(EventKind::BudgetWarning, &key, &record, new, limit);
            }
            if old < limit && new >= limit && stage != Some(AlertStage::Exceeded) {
                state.alerted.insert(key.clone(), AlertStage::Exceeded);
                self.publish_alert(EventKind::BudgetExceeded, &key, &record, new, limit);
            }
        }
        Ok(())
    }

    /// Usage totals for a scope id over the current UTC period.
    pub fn get_usage(&self, scope_id: &str, period: BudgetPeriod) -> UsageSummary {
        let (from, to) = period.range(Utc::now().date_naive());
        let mut summary = UsageSummary::default();
        for record in self.store.load_range(from, to) {
            if record.agent_id == scope_id || record.project_path == scope_id {
                summary.add(&record);
            }
        }
        summary
    }

    /// Budget limits for a scope id: agent, then project, then global.
    pub fn get_budget(&self, scope_id: &str) -> BudgetLimits {
        self.book.for_scope(scope_id)
    }

    /// Usage grouped by agent over the current period.
    pub fn generate_report(&self, query: &ReportQuery) -> BudgetReport {
        let period = query.period.unwrap_or(BudgetPeriod::Day);
        let (from, to) = period.range(Utc::now().date_naive());
        let mut agents: HashMap<String, UsageSummary> = HashMap::new();
        let mut total = UsageSummary::default();
        for record in self.store.load_range(from, to) {
            if let Some(project) = &query.project_path {
                if &record.project_path != project {
                    continue;
                }
            }
            if let Some(agent) = &query.agent_id {
                if &record.agent_id != agent {
                    continue;
                }
            }
            agents
                .entry(record.agent_id.clone())
                .or_default()
                .add(&record);
            total.add(&record);
        }
        BudgetReport {
            period,
            agents,
            total,
        }
    }

    /// Today's token total for one session, for fleet snapshots.
    pub fn session_tokens_today(&self, session_name: &str) -> u64 {
        self.store
            .load_day(Utc::now().date_naive())
            .iter()
            .filter(|r| r.session_name == session_name)
            .map(|r| r.input_tokens + r.output_tokens)
            .sum()
    }

    /// Barrier ensuring any in-flight record+alert cycle has finished.
    pub async fn flush(&self) {
        let _guard = self.state.lock().await;
        debug!("budget meter flushed");
    }

    fn watched_buckets(&self, record: &UsageRecord) -> Vec<(BucketKey, f64, f64)> {
        let date = record.timestamp.date_naive();
        let mut watched = Vec::new();
        let scopes: [(ScopeKind, &str, Option<&BudgetLimits>); 3] = [
            (
                ScopeKind::Agent,
                record.agent_id.as_str(),
                self.book.agents.get(&record.agent_id),
            ),
            (
                ScopeKind::Project,
                record.project_path.as_str(),
                self.book.projects.get(&record.project_path),
            ),
            (ScopeKind::Global, "global", self.book.global.as_ref()),
        ];
        for (scope, scope_id, limits) in scopes {
            let Some(limits) = limits else { continue };
            let periods = [
                (BudgetPeriod::Day, limits.daily_limit),
                (BudgetPeriod::Week, limits.weekly_limit),
                (BudgetPeriod::Month, limits.monthly_limit),
            ];
            for (period, limit) in periods {
                let Some(limit) = limit else { continue };
                if limit <= 0.0 {
                    continue;
                }
                watched.push((
                    BucketKey {
                        scope,
                        scope_id: scope_id.to_string(),
                        period,
                        bucket: period.bucket_key(date),
                    },
                    limit,
                    limits.warning_threshold.clamp(0.0, 1.0),
                ));
            }
        }
        watched
    }

    fn sum_from_disk(&self, key: &BucketKey, date: NaiveDate) -> f64 {
        let (from, to) = key.period.range(date);
        self.store
            .load_range(from, to)
            .iter()
            .filter(|r| match key.scope {
                ScopeKind::Agent => r.agent_id == key.scope_id,
                ScopeKind::Project => r.project_path == key.scope_id,
                ScopeKind::Global => true,
            })
            .map(|r| r.estimated_cost)
            .sum()
    }

    async fn append_with_retry(&self, record: &UsageRecord) -> BudgetResult<()> {
        let mut delay = APPEND_BACKOFF;
        let mut last_error = String::new();
        for attempt in 1..=APPEND_RETRIES {
            match self.store.append(record) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "usage append failed (attempt {}/{}): {}",
                        attempt, APPEND_RETRIES, e
                    );
                    last_error = e.to_string();
                    if attempt < APPEND_RETRIES {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(BudgetError::AppendRetriesExhausted {
            attempts: APPEND_RETRIES,
            last_error,
        })
    }

    fn publish_alert(
        &self,
        kind: EventKind,
        key: &BucketKey,
        record: &UsageRecord,
        spend: f64,
        limit: f64,
    ) {
        warn!(
            "{} for {} scope '{}' ({:?}): ${:.2} of ${:.2}",
            kind,
            key.scope.as_str(),
            key.scope_id,
            key.period,
            spend,
            limit
        );
        self.events.publish(
            Event::new(kind)
                .with_agent(record.agent_id.clone())
                .with_session(record.session_name.clone())
                .with_metadata(serde_json::json!({
                    "scope": key.scope.as_str(),
                    "scopeId": key.scope_id,
                    "period": key.period.bucket_key(record.timestamp.date_naive()),
                    "spend": spend,
                    "limit": limit,
                })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_bucket_keys() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert_eq!(BudgetPeriod::Day.bucket_key(date), "2026-08-01");
        assert_eq!(BudgetPeriod::Month.bucket_key(date), "2026-08");
        assert_eq!(BudgetPeriod::Week.bucket_key(date), "2026-W31");
    }

    #[test]
    fn test_week_range_is_monday_aligned() {
        // 2026-08-01 is a Saturday.
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let (from, to) = BudgetPeriod::Week.range(date);
        assert_eq!(from, NaiveDate::from_ymd_opt(2026, 7, 27).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 8, 2).unwrap());
    }

    #[test]
    fn test_month_range_handles_december() {
        let date = NaiveDate::from_ymd_opt(2026, 12, 15).unwrap();
        let (from, to) = BudgetPeriod::Month.range(date);
        assert_eq!(from, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 12, 31).unwrap());
    }
}
