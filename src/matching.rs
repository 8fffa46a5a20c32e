use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::exceptions::ExceptionRow;
use crate::db::playbooks::PlaybookRow;
use crate::packs::TenantPolicyPack;

// key: playbook-matching -> pure-ranking
//
// Pure and idempotent: evaluates candidate conditions against exception
// attributes and returns a recommendation with reasoning. Never emits
// events or mutates state.

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub playbook: Option<PlaybookRow>,
    pub reasoning: String,
}

struct ConditionOutcome {
    matches: bool,
    priority: i32,
    reason: String,
}

pub fn match_playbook(
    exception: &ExceptionRow,
    candidates: &[PlaybookRow],
    tenant_policy: Option<&TenantPolicyPack>,
    now: DateTime<Utc>,
) -> MatchResult {
    if candidates.is_empty() {
        return MatchResult {
            playbook: None,
            reasoning: "no playbooks found for tenant".to_string(),
        };
    }

    let domain = exception.domain().map(str::to_string);
    let severity = exception
        .severity()
        .map(|severity| severity.as_str().to_lowercase());
    let sla_minutes_remaining = sla_minutes_remaining(&exception.normalized_context, now);
    let policy_tags = policy_tags(exception, tenant_policy);

    let mut matching: Vec<(&PlaybookRow, i32, String)> = Vec::new();
    for candidate in candidates {
        let outcome = evaluate_conditions(
            candidate,
            domain.as_deref(),
            &exception.exception_type,
            severity.as_deref(),
            sla_minutes_remaining,
            &policy_tags,
        );
        if outcome.matches {
            matching.push((candidate, outcome.priority, outcome.reason));
        }
    }

    if matching.is_empty() {
        return MatchResult {
            playbook: None,
            reasoning: "no playbooks matched the exception conditions".to_string(),
        };
    }

    // Higher priority wins; ties broken by newer playbook id.
    matching.sort_by(|a, b| (-a.1, -a.0.playbook_id).cmp(&(-b.1, -b.0.playbook_id)));
    let (best, best_priority, best_reason) = &matching[0];

    let mut reasoning = format!(
        "selected playbook '{}' (priority={}, playbook_id={}): {}",
        best.name, best_priority, best.playbook_id, best_reason
    );
    if matching.len() > 1 {
        reasoning.push_str(&format!(" (evaluated {} matching playbooks)", matching.len()));
    }

    MatchResult {
        playbook: Some((*best).clone()),
        reasoning,
    }
}

fn sla_minutes_remaining(normalized_context: &Value, now: DateTime<Utc>) -> Option<i64> {
    let deadline = normalized_context.get("sla_deadline")?;
    let deadline = match deadline {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()?,
        Value::Number(number) => {
            let seconds = number.as_i64()?;
            DateTime::<Utc>::from_timestamp(seconds, 0)?
        }
        _ => return None,
    };
    Some((deadline - now).num_minutes())
}

fn policy_tags(exception: &ExceptionRow, tenant_policy: Option<&TenantPolicyPack>) -> Vec<String> {
    let from_context: Vec<String> = exception
        .normalized_context
        .get("policy_tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if !from_context.is_empty() {
        return from_context;
    }
    tenant_policy
        .map(|policy| policy.tags.clone())
        .unwrap_or_default()
}

fn evaluate_conditions(
    playbook: &PlaybookRow,
    domain: Option<&str>,
    exception_type: &str,
    severity: Option<&str>,
    sla_minutes_remaining: Option<i64>,
    policy_tags: &[String],
) -> ConditionOutcome {
    let conditions = &playbook.conditions;
    let empty = Value::Object(Default::default());
    let conditions = if conditions.is_object() { conditions } else { &empty };

    // Match conditions may sit at the root or under a "match" key.
    let match_conditions = conditions.get("match").filter(|v| v.is_object()).unwrap_or(conditions);
    let priority = conditions
        .get("priority")
        .and_then(Value::as_i64)
        .map(|value| value as i32)
        .unwrap_or(playbook.priority);

    let fail = |reason: String| ConditionOutcome {
        matches: false,
        priority,
        reason,
    };

    if let Some(required) = match_conditions.get("domain").and_then(Value::as_str) {
        if domain != Some(required) {
            return fail(format!(
                "domain mismatch: expected '{required}', got '{}'",
                domain.unwrap_or("<none>")
            ));
        }
    }

    if let Some(required) = match_conditions.get("exception_type").and_then(Value::as_str) {
        if exception_type != required {
            return fail(format!(
                "exception_type mismatch: expected '{required}', got '{exception_type}'"
            ));
        }
    }

    if let Some(allowed) = match_conditions.get("severity_in") {
        let allowed: Vec<String> = allowed
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        let matched = severity
            .map(|severity| allowed.iter().any(|candidate| candidate == severity))
            .unwrap_or(false);
        if !matched {
            return fail(format!(
                "severity mismatch: expected one of {allowed:?}, got '{}'",
                severity.unwrap_or("<none>")
            ));
        }
    } else if let Some(required) = match_conditions.get("severity").and_then(Value::as_str) {
        let required_lower = required.to_lowercase();
        if severity != Some(required_lower.as_str()) {
            return fail(format!(
                "severity mismatch: expected '{required}', got '{}'",
                severity.unwrap_or("<none>")
            ));
        }
    }

    if let Some(max_minutes) = match_conditions
        .get("sla_minutes_remaining_lt")
        .and_then(Value::as_i64)
    {
        match sla_minutes_remaining {
            None => return fail("SLA condition not met: sla_deadline not available".to_string()),
            Some(remaining) if remaining >= max_minutes => {
                return fail(format!(
                    "SLA condition not met: expected < {max_minutes} minutes, got {remaining}"
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(required_tags) = match_conditions.get("policy_tags") {
        let required: Vec<&str> = required_tags
            .as_array()
            .map(|values| values.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for tag in &required {
            if !policy_tags.iter().any(|candidate| candidate == tag) {
                return fail(format!("policy_tags condition not met: missing '{tag}'"));
            }
        }
    }

    ConditionOutcome {
        matches: true,
        priority,
        reason: "matched conditions".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn exception(context: Value, severity: &str) -> ExceptionRow {
        ExceptionRow {
            exception_id: "EXC-1".into(),
            tenant_id: "t1".into(),
            source_system: "billing".into(),
            exception_type: "DataQualityFailure".into(),
            severity: severity.into(),
            resolution_status: "IN_PROGRESS".into(),
            raw_payload: json!({}),
            normalized_context: context,
            current_playbook_id: None,
            current_step: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn playbook(id: i64, priority: i32, conditions: Value) -> PlaybookRow {
        PlaybookRow {
            playbook_id: id,
            tenant_id: "t1".into(),
            name: format!("pb-{id}"),
            version: 1,
            exception_type: "DataQualityFailure".into(),
            conditions,
            priority,
        }
    }

    #[test]
    fn ranks_by_priority_then_newer_id() {
        let exc = exception(json!({"domain": "billing"}), "MEDIUM");
        let candidates = vec![
            playbook(1, 0, json!({"priority": 5, "match": {"domain": "billing"}})),
            playbook(2, 0, json!({"priority": 10, "match": {"domain": "billing"}})),
            playbook(3, 0, json!({"priority": 10, "match": {"domain": "billing"}})),
        ];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert_eq!(result.playbook.unwrap().playbook_id, 3);
        assert!(result.reasoning.contains("evaluated 3 matching playbooks"));
    }

    #[test]
    fn severity_in_is_case_insensitive() {
        let exc = exception(json!({}), "HIGH");
        let candidates = vec![playbook(1, 0, json!({"severity_in": ["High", "CRITICAL"]}))];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert!(result.playbook.is_some());
    }

    #[test]
    fn exception_type_requires_exact_match() {
        let exc = exception(json!({}), "MEDIUM");
        let candidates = vec![playbook(1, 0, json!({"exception_type": "PaymentTimeout"}))];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert!(result.playbook.is_none());
        assert!(result.reasoning.contains("no playbooks matched"));
    }

    #[test]
    fn sla_condition_fails_without_deadline() {
        let exc = exception(json!({}), "MEDIUM");
        let candidates = vec![playbook(1, 0, json!({"sla_minutes_remaining_lt": 60}))];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert!(result.playbook.is_none());
    }

    #[test]
    fn sla_condition_compares_remaining_minutes() {
        let now = Utc::now();
        let deadline = (now + Duration::minutes(30)).to_rfc3339();
        let exc = exception(json!({"sla_deadline": deadline}), "MEDIUM");
        let candidates = vec![playbook(1, 0, json!({"sla_minutes_remaining_lt": 60}))];
        let result = match_playbook(&exc, &candidates, None, now);
        assert!(result.playbook.is_some());

        let far = (now + Duration::minutes(120)).to_rfc3339();
        let exc = exception(json!({"sla_deadline": far}), "MEDIUM");
        let result = match_playbook(&exc, &candidates, None, now);
        assert!(result.playbook.is_none());
    }

    #[test]
    fn unparsable_sla_deadline_fails_condition() {
        let exc = exception(json!({"sla_deadline": "not-a-date"}), "MEDIUM");
        let candidates = vec![playbook(1, 0, json!({"sla_minutes_remaining_lt": 60}))];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert!(result.playbook.is_none());
    }

    #[test]
    fn policy_tags_fall_back_to_tenant_policy() {
        let exc = exception(json!({}), "MEDIUM");
        let policy: TenantPolicyPack = serde_json::from_value(json!({
            "tenantId": "t1",
            "domainName": "billing",
            "tags": ["regulated"],
        }))
        .unwrap();
        let candidates = vec![playbook(1, 0, json!({"policy_tags": ["regulated"]}))];
        let result = match_playbook(&exc, &candidates, Some(&policy), Utc::now());
        assert!(result.playbook.is_some());

        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert!(result.playbook.is_none());
    }

    #[test]
    fn priority_falls_back_to_playbook_column() {
        let exc = exception(json!({}), "MEDIUM");
        let candidates = vec![
            playbook(1, 20, json!({})),
            playbook(2, 5, json!({})),
        ];
        let result = match_playbook(&exc, &candidates, None, Utc::now());
        assert_eq!(result.playbook.unwrap().playbook_id, 1);
    }
}
