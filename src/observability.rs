use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;

use crate::agents::AgentDecision;

// key: observability -> tenant-counters,audit

/// Input to the alert evaluator, assembled per tenant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantMetricsSnapshot {
    pub exception_count: u64,
    pub critical_recurrences: Vec<(String, u64)>,
    pub open_breaker_tools: Vec<i64>,
    pub oldest_pending_approval_seconds: Option<f64>,
}

#[derive(Debug, Default)]
struct TenantCounters {
    exception_count: u64,
    by_severity: HashMap<String, u64>,
    by_type: HashMap<String, u64>,
    critical_by_type: HashMap<String, u64>,
    tool_failures: u64,
}

/// In-process per-tenant counters: exception volume, recurrence of CRITICAL
/// types, tool failures, and the age of pending human approvals.
#[derive(Default)]
pub struct TenantMetrics {
    counters: DashMap<String, TenantCounters>,
    pending_approvals: DashMap<(String, String), Instant>,
}

impl TenantMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exception(&self, tenant_id: &str, exception_type: &str, severity: &str) {
        let mut counters = self.counters.entry(tenant_id.to_string()).or_default();
        counters.exception_count += 1;
        *counters
            .by_severity
            .entry(severity.to_uppercase())
            .or_default() += 1;
        *counters.by_type.entry(exception_type.to_string()).or_default() += 1;
        if severity.eq_ignore_ascii_case("CRITICAL") {
            *counters
                .critical_by_type
                .entry(exception_type.to_string())
                .or_default() += 1;
        }
    }

    pub fn record_tool_failure(&self, tenant_id: &str) {
        self.counters
            .entry(tenant_id.to_string())
            .or_default()
            .tool_failures += 1;
    }

    /// A risky step is waiting for a human; tracked for queue-aging alerts.
    pub fn approval_pending(&self, tenant_id: &str, exception_id: &str) {
        self.pending_approvals
            .entry((tenant_id.to_string(), exception_id.to_string()))
            .or_insert_with(Instant::now);
    }

    pub fn approval_settled(&self, tenant_id: &str, exception_id: &str) {
        self.pending_approvals
            .remove(&(tenant_id.to_string(), exception_id.to_string()));
    }

    pub fn snapshot(&self, tenant_id: &str, open_breaker_tools: Vec<i64>) -> TenantMetricsSnapshot {
        let (exception_count, critical_recurrences) = match self.counters.get(tenant_id) {
            Some(counters) => (
                counters.exception_count,
                counters
                    .critical_by_type
                    .iter()
                    .map(|(exception_type, count)| (exception_type.clone(), *count))
                    .collect(),
            ),
            None => (0, Vec::new()),
        };
        let oldest_pending_approval_seconds = self
            .pending_approvals
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().elapsed().as_secs_f64())
            .fold(None::<f64>, |acc, age| {
                Some(acc.map_or(age, |current| current.max(age)))
            });
        TenantMetricsSnapshot {
            exception_count,
            critical_recurrences,
            open_breaker_tools,
            oldest_pending_approval_seconds,
        }
    }

    pub fn tenants(&self) -> Vec<String> {
        self.counters.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Append-only JSONL audit of agent decisions, one file per tenant. Feeds
/// compliance reviews; never read on the hot path.
pub struct AuditLogger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_agent_decision(
        &self,
        tenant_id: &str,
        agent_name: &str,
        exception_id: &str,
        decision: &AgentDecision,
    ) {
        tracing::info!(
            %tenant_id,
            agent = agent_name,
            %exception_id,
            decision = %decision.decision,
            confidence = decision.confidence,
            next_step = %decision.next_step,
            "agent decision"
        );
        let record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "agent": agent_name,
            "exception_id": exception_id,
            "decision": decision,
        });
        let _guard = self.write_lock.lock().expect("audit logger mutex");
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            tracing::error!(?err, "failed to create audit directory");
            return;
        }
        let path = self.dir.join(format!("{tenant_id}.jsonl"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{record}"));
        if let Err(err) = result {
            tracing::error!(?err, path = %path.display(), "failed to append audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_recurrence_and_volume() {
        let metrics = TenantMetrics::new();
        for _ in 0..3 {
            metrics.record_exception("t1", "OutageDetected", "CRITICAL");
        }
        metrics.record_exception("t1", "DataQualityFailure", "MEDIUM");
        metrics.record_exception("t2", "DataQualityFailure", "LOW");

        let snapshot = metrics.snapshot("t1", vec![]);
        assert_eq!(snapshot.exception_count, 4);
        assert_eq!(
            snapshot.critical_recurrences,
            vec![("OutageDetected".to_string(), 3)]
        );

        let other = metrics.snapshot("t2", vec![]);
        assert_eq!(other.exception_count, 1);
        assert!(other.critical_recurrences.is_empty());
    }

    #[test]
    fn approval_aging_tracks_oldest() {
        let metrics = TenantMetrics::new();
        assert!(metrics
            .snapshot("t1", vec![])
            .oldest_pending_approval_seconds
            .is_none());
        metrics.approval_pending("t1", "EXC-1");
        let snapshot = metrics.snapshot("t1", vec![]);
        assert!(snapshot.oldest_pending_approval_seconds.is_some());
        metrics.approval_settled("t1", "EXC-1");
        assert!(metrics
            .snapshot("t1", vec![])
            .oldest_pending_approval_seconds
            .is_none());
    }

    #[test]
    fn audit_logger_journals_per_tenant() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(tmp.path());
        let decision = AgentDecision {
            decision: "ALLOW".into(),
            confidence: 0.9,
            evidence: vec!["rule matched".into()],
            next_step: "ExecutePlaybook".into(),
        };
        logger.log_agent_decision("t1", "PolicyAgent", "EXC-1", &decision);
        let contents = std::fs::read_to_string(tmp.path().join("t1.jsonl")).unwrap();
        assert!(contents.contains("PolicyAgent"));
        assert!(contents.contains("nextStep"));
    }
}
