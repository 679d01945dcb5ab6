//! Performance monitor keyed by operation fingerprint.
//!
//! Keeps bounded latency histories, a ring of slow operations, a ring of
//! recent errors and per-fingerprint aggregates. Everything is exposed as a
//! serializable snapshot for the status endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

use crate::fingerprint::OperationFingerprint;

const DEFAULT_HISTORY_SIZE: usize = 200;
const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1_000;
const MAX_SQL_LEN: usize = 2048;
const MAX_TRACKED_FINGERPRINTS: usize = 1024;
const TOP_FINGERPRINTS: usize = 10;

/// Which statement path an operation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Update,
}

#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    started_at: Instant,
    started_at_ms: u64,
    slow_threshold: Duration,
    history_size: usize,
    total_queries: AtomicU64,
    total_updates: AtomicU64,
    total_errors: AtomicU64,
    total_slow: AtomicU64,
    in_flight_queries: AtomicU64,
    in_flight_updates: AtomicU64,
    query_latencies: RwLock<VecDeque<u64>>,
    update_latencies: RwLock<VecDeque<u64>>,
    slow_operations: RwLock<VecDeque<SlowOperation>>,
    recent_errors: RwLock<VecDeque<ErrorEvent>>,
    fingerprints: RwLock<HashMap<OperationFingerprint, FingerprintStats>>,
}

#[derive(Clone, Serialize)]
pub struct SlowOperation {
    pub timestamp_ms: u64,
    pub fingerprint: String,
    pub duration_ms: u64,
    pub sql: String,
    pub rows: Option<u64>,
    pub kind: OperationKind,
    pub reasons: Vec<String>,
}

#[derive(Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp_ms: u64,
    pub message: String,
    pub fingerprint: Option<String>,
    pub sql: Option<String>,
    pub context: String,
}

#[derive(Clone, Serialize)]
pub struct FingerprintStats {
    pub fingerprint: String,
    pub sql: String,
    pub kind: OperationKind,
    pub count: u64,
    pub errors: u64,
    pub slow: u64,
    pub total_ms: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Clone, Serialize)]
pub struct MonitorSnapshot {
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    pub slow_query_threshold_ms: u64,
    pub totals: TotalsSnapshot,
    pub in_flight: InFlightSnapshot,
    pub latency: LatencyStatsSnapshot,
    pub slow_operations: Vec<SlowOperation>,
    pub top_fingerprints: Vec<FingerprintStats>,
    pub tracked_fingerprints: usize,
    pub recent_errors: Vec<ErrorEvent>,
    pub history_size: usize,
}

#[derive(Clone, Serialize)]
pub struct TotalsSnapshot {
    pub queries: u64,
    pub updates: u64,
    pub errors: u64,
    pub slow_operations: u64,
}

#[derive(Clone, Serialize)]
pub struct InFlightSnapshot {
    pub queries: u64,
    pub updates: u64,
}

#[derive(Clone, Serialize)]
pub struct LatencyStatsSnapshot {
    pub queries: LatencySummarySnapshot,
    pub updates: LatencySummarySnapshot,
}

#[derive(Clone, Serialize)]
pub struct LatencySummarySnapshot {
    pub count: usize,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Counts an operation as in flight until dropped.
pub struct InFlightGuard {
    inner: Arc<MonitorInner>,
    kind: OperationKind,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight(self.kind).fetch_sub(1, Ordering::Relaxed);
    }
}

impl MonitorInner {
    fn in_flight(&self, kind: OperationKind) -> &AtomicU64 {
        match kind {
            OperationKind::Query => &self.in_flight_queries,
            OperationKind::Update => &self.in_flight_updates,
        }
    }
}

/// Result of one monitored operation.
pub enum Outcome<'a> {
    Success { rows: Option<u64> },
    Failure { message: &'a str },
}

impl PerformanceMonitor {
    pub fn new(slow_query_threshold_ms: u64, history_size: usize) -> Self {
        let history_size = if history_size == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            history_size
        };
        let threshold_ms = if slow_query_threshold_ms == 0 {
            DEFAULT_SLOW_QUERY_THRESHOLD_MS
        } else {
            slow_query_threshold_ms
        };

        Self {
            inner: Arc::new(MonitorInner {
                started_at: Instant::now(),
                started_at_ms: now_millis(),
                slow_threshold: Duration::from_millis(threshold_ms),
                history_size,
                total_queries: AtomicU64::new(0),
                total_updates: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                total_slow: AtomicU64::new(0),
                in_flight_queries: AtomicU64::new(0),
                in_flight_updates: AtomicU64::new(0),
                query_latencies: RwLock::new(VecDeque::with_capacity(history_size)),
                update_latencies: RwLock::new(VecDeque::with_capacity(history_size)),
                slow_operations: RwLock::new(VecDeque::with_capacity(history_size)),
                recent_errors: RwLock::new(VecDeque::with_capacity(history_size)),
                fingerprints: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn start(&self, kind: OperationKind) -> InFlightGuard {
        self.inner.in_flight(kind).fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: self.inner.clone(),
            kind,
        }
    }

    /// Record a finished statement under its fingerprint.
    pub fn record(
        &self,
        fingerprint: &OperationFingerprint,
        sql: &str,
        kind: OperationKind,
        duration: Duration,
        outcome: Outcome<'_>,
    ) {
        match kind {
            OperationKind::Query => {
                self.inner.total_queries.fetch_add(1, Ordering::Relaxed);
                push_latency(&self.inner.query_latencies, duration, self.inner.history_size);
            }
            OperationKind::Update => {
                self.inner.total_updates.fetch_add(1, Ordering::Relaxed);
                push_latency(&self.inner.update_latencies, duration, self.inner.history_size);
            }
        }

        let duration_ms = duration.as_millis() as u64;
        let sql = compact_sql(sql);
        let (rows, failed) = match outcome {
            Outcome::Success { rows } => (rows, false),
            Outcome::Failure { message } => {
                self.push_error(ErrorEvent {
                    timestamp_ms: now_millis(),
                    message: message.to_string(),
                    fingerprint: Some(fingerprint.to_string()),
                    sql: Some(sql.clone()),
                    context: "execution".to_string(),
                });
                (None, true)
            }
        };
        let slow = duration >= self.inner.slow_threshold;
        self.update_fingerprint(fingerprint, &sql, kind, duration_ms, failed, slow);

        if slow {
            self.inner.total_slow.fetch_add(1, Ordering::Relaxed);
            let threshold_ms = self.inner.slow_threshold.as_millis() as u64;
            let reasons = infer_reasons(&sql, kind, rows, duration_ms, threshold_ms, failed);
            warn!(
                %fingerprint,
                duration_ms,
                threshold_ms,
                ?kind,
                rows = ?rows,
                sql = %sql,
                reasons = ?reasons,
                "slow operation recorded"
            );
            let mut slow_operations = self
                .inner
                .slow_operations
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            push_ring(
                &mut slow_operations,
                SlowOperation {
                    timestamp_ms: now_millis(),
                    fingerprint: fingerprint.to_string(),
                    duration_ms,
                    sql,
                    rows,
                    kind,
                    reasons,
                },
                self.inner.history_size,
            );
        }
    }

    /// Record an error that is not tied to one statement.
    pub fn record_error(&self, context: &str, message: impl Into<String>) {
        self.push_error(ErrorEvent {
            timestamp_ms: now_millis(),
            message: message.into(),
            fingerprint: None,
            sql: None,
            context: context.to_string(),
        });
    }

    pub fn fingerprint_stats(&self, fingerprint: &OperationFingerprint) -> Option<FingerprintStats> {
        self.inner
            .fingerprints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(fingerprint)
            .cloned()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let uptime_ms = self.inner.started_at.elapsed().as_millis() as u64;
        let totals = TotalsSnapshot {
            queries: self.inner.total_queries.load(Ordering::Relaxed),
            updates: self.inner.total_updates.load(Ordering::Relaxed),
            errors: self.inner.total_errors.load(Ordering::Relaxed),
            slow_operations: self.inner.total_slow.load(Ordering::Relaxed),
        };
        let in_flight = InFlightSnapshot {
            queries: self.inner.in_flight_queries.load(Ordering::Relaxed),
            updates: self.inner.in_flight_updates.load(Ordering::Relaxed),
        };

        let query_latencies = copy_ring(&self.inner.query_latencies);
        let update_latencies = copy_ring(&self.inner.update_latencies);
        let mut slow_operations = copy_ring(&self.inner.slow_operations);
        slow_operations.reverse();
        let mut recent_errors = copy_ring(&self.inner.recent_errors);
        recent_errors.reverse();

        let (top_fingerprints, tracked_fingerprints) = {
            let fingerprints = self
                .inner
                .fingerprints
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                top_by_total(fingerprints.values().cloned().collect(), TOP_FINGERPRINTS),
                fingerprints.len(),
            )
        };

        MonitorSnapshot {
            started_at_ms: self.inner.started_at_ms,
            uptime_ms,
            slow_query_threshold_ms: self.inner.slow_threshold.as_millis() as u64,
            totals,
            in_flight,
            latency: LatencyStatsSnapshot {
                queries: summarize_latencies(query_latencies),
                updates: summarize_latencies(update_latencies),
            },
            slow_operations,
            top_fingerprints,
            tracked_fingerprints,
            recent_errors,
            history_size: self.inner.history_size,
        }
    }

    fn push_error(&self, event: ErrorEvent) {
        self.inner.total_errors.fetch_add(1, Ordering::Relaxed);
        let mut errors = self
            .inner
            .recent_errors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(&mut errors, event, self.inner.history_size);
    }

    fn update_fingerprint(
        &self,
        fingerprint: &OperationFingerprint,
        sql: &str,
        kind: OperationKind,
        duration_ms: u64,
        failed: bool,
        slow: bool,
    ) {
        let mut fingerprints = self
            .inner
            .fingerprints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !fingerprints.contains_key(fingerprint) && fingerprints.len() >= MAX_TRACKED_FINGERPRINTS
        {
            let stalest = fingerprints
                .iter()
                .min_by_key(|(_, stats)| stats.last_seen_ms)
                .map(|(key, _)| key.clone());
            if let Some(stalest) = stalest {
                fingerprints.remove(&stalest);
            }
        }
        let entry = fingerprints
            .entry(fingerprint.clone())
            .or_insert_with(|| FingerprintStats {
                fingerprint: fingerprint.to_string(),
                sql: sql.to_string(),
                kind,
                count: 0,
                errors: 0,
                slow: 0,
                total_ms: 0,
                avg_ms: 0,
                max_ms: 0,
                last_seen_ms: 0,
            });
        entry.count = entry.count.saturating_add(1);
        entry.errors += u64::from(failed);
        entry.slow += u64::from(slow);
        entry.total_ms = entry.total_ms.saturating_add(duration_ms);
        entry.avg_ms = entry.total_ms / entry.count;
        entry.max_ms = entry.max_ms.max(duration_ms);
        entry.last_seen_ms = now_millis();
    }
}

fn copy_ring<T: Clone>(ring: &RwLock<VecDeque<T>>) -> Vec<T> {
    ring.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .cloned()
        .collect()
}

fn push_latency(target: &RwLock<VecDeque<u64>>, duration: Duration, max: usize) {
    let mut latencies = target
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    push_ring(&mut latencies, duration.as_millis() as u64, max);
}

fn push_ring<T>(target: &mut VecDeque<T>, value: T, max: usize) {
    if target.len() >= max {
        target.pop_front();
    }
    target.push_back(value);
}

fn top_by_total(mut stats: Vec<FingerprintStats>, limit: usize) -> Vec<FingerprintStats> {
    stats.sort_unstable_by(|a, b| {
        b.total_ms
            .cmp(&a.total_ms)
            .then_with(|| b.max_ms.cmp(&a.max_ms))
            .then_with(|| b.count.cmp(&a.count))
    });
    stats.truncate(limit);
    stats
}

fn summarize_latencies(values: Vec<u64>) -> LatencySummarySnapshot {
    if values.is_empty() {
        return LatencySummarySnapshot {
            count: 0,
            avg_ms: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            max_ms: 0,
        };
    }

    let count = values.len();
    let sum: u64 = values.iter().sum();
    let avg_ms = sum / count as u64;

    let mut sorted = values;
    sorted.sort_unstable();
    let max_ms = *sorted.last().unwrap_or(&0);

    LatencySummarySnapshot {
        count,
        avg_ms,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
        max_ms,
    }
}

fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn compact_sql(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_SQL_LEN {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(MAX_SQL_LEN).collect();
    out.push_str("...");
    out
}

fn infer_reasons(
    sql: &str,
    kind: OperationKind,
    rows: Option<u64>,
    duration_ms: u64,
    slow_threshold_ms: u64,
    failed: bool,
) -> Vec<String> {
    let mut reasons = Vec::new();
    let lower = sql.to_ascii_lowercase();

    if rows.is_some_and(|rows| rows >= 100_000) {
        reasons.push("Large result set".to_string());
    }

    if lower.contains(" join ")
        || lower.contains(" group by ")
        || lower.contains(" order by ")
        || lower.contains(" distinct ")
        || lower.contains(" union ")
        || lower.contains(" window ")
    {
        reasons.push("Join/aggregation/sort".to_string());
    }

    if lower.contains("select *") {
        reasons.push("Wide select".to_string());
    }

    if lower.contains(" like '%") || lower.contains(" ilike '%") {
        reasons.push("Leading wildcard match".to_string());
    }

    if kind == OperationKind::Update {
        reasons.push("Write-heavy statement".to_string());
    }

    if duration_ms >= slow_threshold_ms.saturating_mul(3) {
        reasons.push("Very long-running".to_string());
    }

    if failed {
        reasons.push("Errored before completion".to_string());
    }

    reasons
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_apply_for_zero_values() {
        let monitor = PerformanceMonitor::new(0, 0);
        let snapshot = monitor.snapshot();

        assert_eq!(
            snapshot.slow_query_threshold_ms,
            DEFAULT_SLOW_QUERY_THRESHOLD_MS
        );
        assert_eq!(snapshot.history_size, DEFAULT_HISTORY_SIZE);
    }

    #[test]
    fn in_flight_guards_increment_and_decrement_counts() {
        let monitor = PerformanceMonitor::new(100, 8);
        {
            let _query = monitor.start(OperationKind::Query);
            let _update = monitor.start(OperationKind::Update);
            let snapshot = monitor.snapshot();
            assert_eq!(snapshot.in_flight.queries, 1);
            assert_eq!(snapshot.in_flight.updates, 1);
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.in_flight.queries, 0);
        assert_eq!(snapshot.in_flight.updates, 0);
    }

    #[test]
    fn records_aggregate_per_fingerprint() -> anyhow::Result<()> {
        let monitor = PerformanceMonitor::new(10, 2);
        let select = OperationFingerprint::of_sql("SELECT * FROM t");
        let delete = OperationFingerprint::of_sql("DELETE FROM t WHERE id = 10");

        monitor.record(
            &select,
            "SELECT * FROM t",
            OperationKind::Query,
            Duration::from_millis(5),
            Outcome::Success { rows: Some(1) },
        );
        monitor.record(
            &select,
            "SELECT * FROM t",
            OperationKind::Query,
            Duration::from_millis(15),
            Outcome::Failure {
                message: "query failed",
            },
        );
        monitor.record(
            &delete,
            "DELETE FROM t WHERE id = 10",
            OperationKind::Update,
            Duration::from_millis(25),
            Outcome::Success { rows: Some(1) },
        );
        monitor.record_error("lob", "upload aborted");

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.totals.queries, 2);
        assert_eq!(snapshot.totals.updates, 1);
        assert_eq!(snapshot.totals.errors, 2);
        assert_eq!(snapshot.totals.slow_operations, 2);
        assert_eq!(snapshot.tracked_fingerprints, 2);
        assert_eq!(snapshot.recent_errors.len(), 2);
        assert_eq!(snapshot.recent_errors[0].context, "lob");

        let stats = monitor
            .fingerprint_stats(&select)
            .ok_or_else(|| anyhow::anyhow!("select fingerprint was not tracked"))?;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.slow, 1);
        assert_eq!(stats.max_ms, 15);
        assert_eq!(stats.avg_ms, 10);
        assert_eq!(snapshot.top_fingerprints[0].fingerprint, delete.to_string());
        Ok(())
    }

    #[test]
    fn summarize_latencies_handles_empty_and_percentiles() {
        let empty = summarize_latencies(vec![]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.max_ms, 0);

        let summary = summarize_latencies(vec![100, 10, 30, 20]);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.avg_ms, 40);
        assert_eq!(summary.p50_ms, 30);
        assert_eq!(summary.p95_ms, 100);
        assert_eq!(summary.max_ms, 100);
    }

    #[test]
    fn sql_compaction_truncates_long_text() {
        assert_eq!(
            compact_sql("SELECT   *\nFROM   t\tWHERE  id = 1"),
            "SELECT * FROM t WHERE id = 1"
        );
        let long_sql = format!("SELECT {}", "x".repeat(MAX_SQL_LEN + 32));
        let compacted = compact_sql(&long_sql);
        assert!(compacted.ends_with("..."));
        assert_eq!(compacted.chars().count(), MAX_SQL_LEN + 3);
    }

    #[test]
    fn infer_reasons_reports_expected_signals() {
        let reasons = infer_reasons(
            "SELECT * FROM t JOIN u ON t.id = u.id WHERE name LIKE '%abc'",
            OperationKind::Update,
            Some(100_000),
            4_000,
            1_000,
            true,
        );
        for expected in [
            "Large result set",
            "Join/aggregation/sort",
            "Wide select",
            "Leading wildcard match",
            "Write-heavy statement",
            "Very long-running",
            "Errored before completion",
        ] {
            assert!(reasons.iter().any(|r| r == expected), "missing {expected}");
        }

        let none = infer_reasons(
            "SELECT id FROM t WHERE id = 1",
            OperationKind::Query,
            Some(1),
            100,
            1_000,
            false,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn push_ring_obeys_capacity() {
        let mut ring = VecDeque::new();
        push_ring(&mut ring, 1, 2);
        push_ring(&mut ring, 2, 2);
        push_ring(&mut ring, 3, 2);
        assert_eq!(ring.into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }
}
