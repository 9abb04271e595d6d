//! Budget alert edge-triggering and period bucketing.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use crate::budget::{BudgetBook, BudgetLimits, BudgetMeter, BudgetPeriod, UsageRecord};
use crate::events::{Event, EventBus, EventKind};

fn agent_budget(daily: f64, warning: f64) -> BudgetBook {
    let mut book = BudgetBook::default();
    book.agents.insert(
        "a1".to_string(),
        BudgetLimits {
            daily_limit: Some(daily),
            warning_threshold: warning,
            ..Default::default()
        },
    );
    book
}

/// Output tokens on claude-3-5-haiku ($4 per 1M output) give exact cents.
fn record(output_tokens: u64) -> UsageRecord {
    UsageRecord {
        agent_id: "a1".to_string(),
        session_name: "dev-1".to_string(),
        project_path: "/tmp/demo".to_string(),
        timestamp: Utc::now(),
        input_tokens: 0,
        output_tokens,
        model: "claude-3-5-haiku".to_string(),
        operation: "chat".to_string(),
        task_id: None,
        estimated_cost: 0.0,
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn test_warning_then_exceeded_each_fire_once() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let meter = BudgetMeter::with_book(dir.path(), events, agent_budget(1.0, 0.8));

    // $0.85 crosses the $0.80 warning line.
    meter.record_usage(record(212_500)).await.unwrap();
    assert_eq!(drain(&mut rx), vec![EventKind::BudgetWarning]);

    // +$0.20 -> $1.05 crosses the $1.00 limit.
    meter.record_usage(record(50_000)).await.unwrap();
    assert_eq!(drain(&mut rx), vec![EventKind::BudgetExceeded]);

    // +$0.01 fires neither.
    meter.record_usage(record(2_500)).await.unwrap();
    assert_eq!(drain(&mut rx), Vec::<EventKind>::new());
}

#[tokio::test]
async fn test_single_record_crossing_both_lines_fires_both_once() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let meter = BudgetMeter::with_book(dir.path(), events, agent_budget(1.0, 0.8));

    // $1.20 in one record.
    meter.record_usage(record(300_000)).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![EventKind::BudgetWarning, EventKind::BudgetExceeded]
    );

    meter.record_usage(record(2_500)).await.unwrap();
    assert_eq!(drain(&mut rx), Vec::<EventKind>::new());
}

#[tokio::test]
async fn test_daily_rollover_opens_a_fresh_window() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let meter = BudgetMeter::with_book(dir.path(), events, agent_budget(1.0, 0.8));

    let mut day1 = record(225_000); // $0.90
    day1.timestamp = Utc.with_ymd_and_hms(2026, 8, 1, 23, 50, 0).unwrap();
    meter.record_usage(day1).await.unwrap();
    assert_eq!(drain(&mut rx), vec![EventKind::BudgetWarning]);

    // Same spend just after UTC midnight: a new bucket, warning again.
    let mut day2 = record(225_000);
    day2.timestamp = Utc.with_ymd_and_hms(2026, 8, 2, 0, 10, 0).unwrap();
    meter.record_usage(day2).await.unwrap();
    assert_eq!(drain(&mut rx), vec![EventKind::BudgetWarning]);
}

#[tokio::test]
async fn test_unbudgeted_scopes_never_alert() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let meter = BudgetMeter::with_book(dir.path(), events, BudgetBook::default());

    meter.record_usage(record(10_000_000)).await.unwrap();
    assert_eq!(drain(&mut rx), Vec::<EventKind>::new());
}

#[tokio::test]
async fn test_get_usage_sums_and_breaks_down() {
    let dir = tempfile::tempdir().unwrap();
    let meter = BudgetMeter::with_book(dir.path(), EventBus::new(), BudgetBook::default());

    meter.record_usage(record(100_000)).await.unwrap();
    let mut other_op = record(50_000);
    other_op.operation = "tool_use".to_string();
    meter.record_usage(other_op).await.unwrap();

    let usage = meter.get_usage("a1", BudgetPeriod::Day);
    assert_eq!(usage.output_tokens, 150_000);
    assert_eq!(usage.by_operation.len(), 2);
    assert_eq!(usage.by_model.len(), 1);
    assert!((usage.estimated_cost - 0.6).abs() < 1e-9);

    // Project-path scope matches the same records.
    let by_project = meter.get_usage("/tmp/demo", BudgetPeriod::Day);
    assert_eq!(by_project.output_tokens, 150_000);
}

#[tokio::test]
async fn test_report_groups_by_agent() {
    let dir = tempfile::tempdir().unwrap();
    let meter = BudgetMeter::with_book(dir.path(), EventBus::new(), BudgetBook::default());

    meter.record_usage(record(10_000)).await.unwrap();
    let mut other_agent = record(20_000);
    other_agent.agent_id = "a2".to_string();
    other_agent.session_name = "dev-2".to_string();
    meter.record_usage(other_agent).await.unwrap();

    let report = meter.generate_report(&Default::default());
    assert_eq!(report.agents.len(), 2);
    assert_eq!(report.agents["a1"].output_tokens, 10_000);
    assert_eq!(report.agents["a2"].output_tokens, 20_000);
    assert_eq!(report.total.output_tokens, 30_000);

    let filtered = meter.generate_report(&crate::budget::ReportQuery {
        agent_id: Some("a2".to_string()),
        ..Default::default()
    });
    assert_eq!(filtered.agents.len(), 1);
    assert_eq!(filtered.total.output_tokens, 20_000);
}

#[tokio::test]
async fn test_session_tokens_today() {
    let dir = tempfile::tempdir().unwrap();
    let meter = BudgetMeter::with_book(dir.path(), EventBus::new(), BudgetBook::default());

    let mut r = record(5_000);
    r.input_tokens = 1_000;
    meter.record_usage(r).await.unwrap();
    assert_eq!(meter.session_tokens_today("dev-1"), 6_000);
    assert_eq!(meter.session_tokens_today("dev-9"), 0);
}
