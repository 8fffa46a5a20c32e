use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::db::exceptions::Severity;
use crate::observability::TenantMetricsSnapshot;

// key: alert-evaluator -> per-tenant-rules

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertRuleType {
    HighExceptionVolume,
    RepeatedCriticalBreaks,
    ToolCircuitBreakerOpen,
    ApprovalQueueAging,
}

impl AlertRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRuleType::HighExceptionVolume => "HIGH_EXCEPTION_VOLUME",
            AlertRuleType::RepeatedCriticalBreaks => "REPEATED_CRITICAL_BREAKS",
            AlertRuleType::ToolCircuitBreakerOpen => "TOOL_CIRCUIT_BREAKER_OPEN",
            AlertRuleType::ApprovalQueueAging => "APPROVAL_QUEUE_AGING",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub rule_type: AlertRuleType,
    pub severity: Severity,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub tenant_id: String,
    pub rule_type: AlertRuleType,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Runs the configured rules over a tenant metrics snapshot. Active alerts
/// are de-duplicated by `(tenant_id, rule_type)` until resolved.
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    active: DashMap<(String, AlertRuleType), Alert>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            active: DashMap::new(),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new(vec![
            AlertRule {
                rule_type: AlertRuleType::HighExceptionVolume,
                severity: Severity::High,
                threshold: 100.0,
            },
            AlertRule {
                rule_type: AlertRuleType::RepeatedCriticalBreaks,
                severity: Severity::Critical,
                threshold: 5.0,
            },
            AlertRule {
                rule_type: AlertRuleType::ToolCircuitBreakerOpen,
                severity: Severity::High,
                threshold: 1.0,
            },
            AlertRule {
                rule_type: AlertRuleType::ApprovalQueueAging,
                severity: Severity::Medium,
                threshold: 3600.0,
            },
        ])
    }

    /// Evaluate all rules; returns only alerts that fired newly this round.
    pub fn evaluate(&self, tenant_id: &str, metrics: &TenantMetricsSnapshot) -> Vec<Alert> {
        let mut fired = Vec::new();
        for rule in &self.rules {
            let Some(message) = self.check_rule(rule, metrics) else {
                continue;
            };
            let key = (tenant_id.to_string(), rule.rule_type);
            if self.active.contains_key(&key) {
                continue;
            }
            let alert = Alert {
                id: Uuid::new_v4(),
                tenant_id: tenant_id.to_string(),
                rule_type: rule.rule_type,
                severity: rule.severity,
                message,
                created_at: Utc::now(),
                acknowledged_by: None,
                resolved_at: None,
            };
            tracing::warn!(
                %tenant_id,
                rule = rule.rule_type.as_str(),
                severity = rule.severity.as_str(),
                message = %alert.message,
                "alert fired"
            );
            self.active.insert(key, alert.clone());
            fired.push(alert);
        }
        fired
    }

    fn check_rule(&self, rule: &AlertRule, metrics: &TenantMetricsSnapshot) -> Option<String> {
        match rule.rule_type {
            AlertRuleType::HighExceptionVolume => {
                if metrics.exception_count as f64 >= rule.threshold {
                    Some(format!(
                        "high exception volume: {} exceptions (threshold: {})",
                        metrics.exception_count, rule.threshold
                    ))
                } else {
                    None
                }
            }
            AlertRuleType::RepeatedCriticalBreaks => {
                let repeated: Vec<&(String, u64)> = metrics
                    .critical_recurrences
                    .iter()
                    .filter(|(_, count)| *count as f64 >= rule.threshold)
                    .collect();
                if repeated.is_empty() {
                    None
                } else {
                    Some(format!(
                        "repeated CRITICAL breaks: {} exception types with {}+ occurrences",
                        repeated.len(),
                        rule.threshold
                    ))
                }
            }
            AlertRuleType::ToolCircuitBreakerOpen => {
                if metrics.open_breaker_tools.is_empty() {
                    None
                } else {
                    Some(format!(
                        "tool circuit breaker open for tools {:?}",
                        metrics.open_breaker_tools
                    ))
                }
            }
            AlertRuleType::ApprovalQueueAging => {
                let oldest = metrics.oldest_pending_approval_seconds?;
                if oldest >= rule.threshold {
                    Some(format!(
                        "approval queue aging: oldest pending approval is {oldest:.0}s old (threshold: {}s)",
                        rule.threshold
                    ))
                } else {
                    None
                }
            }
        }
    }

    pub fn acknowledge(&self, alert_id: Uuid, user: &str) -> bool {
        for mut entry in self.active.iter_mut() {
            if entry.value().id == alert_id && entry.value().acknowledged_by.is_none() {
                entry.value_mut().acknowledged_by = Some(user.to_string());
                return true;
            }
        }
        false
    }

    /// Resolving removes the dedup entry so the rule may fire again.
    pub fn resolve(&self, alert_id: Uuid) -> bool {
        let key = self.active.iter().find_map(|entry| {
            if entry.value().id == alert_id {
                Some(entry.key().clone())
            } else {
                None
            }
        });
        match key {
            Some(key) => self.active.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn active_alerts(&self, tenant_id: Option<&str>) -> Vec<Alert> {
        self.active
            .iter()
            .filter(|entry| tenant_id.map_or(true, |tenant| entry.value().tenant_id == tenant))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Periodic evaluation loop: snapshots each known tenant, fires rules, and
/// notifies the tenant's configured channels for anything new.
pub fn spawn_monitor(
    metrics: std::sync::Arc<crate::observability::TenantMetrics>,
    breakers: std::sync::Arc<crate::tools::breaker::CircuitBreakerRegistry>,
    evaluator: std::sync::Arc<AlertEvaluator>,
    packs: std::sync::Arc<crate::packs::PackRegistry>,
    notifier: std::sync::Arc<crate::notify::NotificationService>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(30);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    for tenant_id in metrics.tenants() {
                        let snapshot =
                            metrics.snapshot(&tenant_id, breakers.open_circuits(&tenant_id));
                        for alert in evaluator.evaluate(&tenant_id, &snapshot) {
                            let Some(policy) = packs
                                .tenant_policy(&tenant_id)
                                .and_then(|policy| policy.notification_policies)
                            else {
                                continue;
                            };
                            let subject = format!(
                                "Alert: {} - {}",
                                alert.severity.as_str(),
                                alert.rule_type.as_str()
                            );
                            let result = notifier
                                .send(&tenant_id, "Ops", &subject, &alert.message, None, &policy)
                                .await;
                            if !result.success {
                                tracing::warn!(%tenant_id, subject = %subject, "alert notification failed on all channels");
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
