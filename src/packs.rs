use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// key: pack-registry -> declarative-config

#[derive(Debug, Error)]
pub enum PackError {
    #[error("pack {domain} v{version} already registered for tenant scope {scope}")]
    AlreadyRegistered {
        domain: String,
        version: String,
        scope: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Guardrails {
    pub allow_lists: Vec<String>,
    pub block_lists: Vec<String>,
    pub human_approval_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeverityRule {
    pub exception_type: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackPlaybook {
    pub name: String,
    pub exception_type: String,
    #[serde(default)]
    pub conditions: Value,
    #[serde(default)]
    pub priority: i32,
}

/// Declarative bundle of rules, tools and playbooks for one business domain.
/// Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DomainPack {
    pub domain: String,
    pub version: String,
    #[serde(default)]
    pub exception_types: Vec<String>,
    #[serde(default)]
    pub severity_rules: Vec<SeverityRule>,
    #[serde(default)]
    pub guardrails: Option<Guardrails>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub playbooks: Vec<PackPlaybook>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeverityOverride {
    pub exception_type: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HumanApprovalRule {
    pub severity: String,
    pub require_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolOverride {
    pub tool_name: String,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetentionPolicies {
    #[serde(rename = "dataTTL")]
    pub data_ttl_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub dimension: Option<usize>,
}

/// Notification routing for a tenant. Webhook URLs and SMTP settings live
/// here, not in the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPolicies {
    pub channels: Vec<String>,
    pub recipients_by_group: std::collections::HashMap<String, Vec<String>>,
    pub webhook_urls: std::collections::HashMap<String, String>,
    pub smtp_config: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

/// Per-tenant overrides layered atop a Domain Pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenantPolicyPack {
    pub tenant_id: String,
    pub domain_name: String,
    #[serde(default)]
    pub custom_severity_overrides: Vec<SeverityOverride>,
    #[serde(default)]
    pub custom_guardrails: Option<Guardrails>,
    #[serde(default)]
    pub approved_tools: Vec<String>,
    #[serde(default)]
    pub tool_overrides: Vec<ToolOverride>,
    #[serde(default)]
    pub human_approval_rules: Vec<HumanApprovalRule>,
    #[serde(default)]
    pub retention_policies: Option<RetentionPolicies>,
    #[serde(default)]
    pub embedding_config: Option<EmbeddingConfig>,
    #[serde(default)]
    pub notification_policies: Option<NotificationPolicies>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TenantPolicyPack {
    /// Effective guardrails: tenant custom guardrails override the domain
    /// pack's.
    pub fn effective_guardrails<'a>(&'a self, domain: Option<&'a DomainPack>) -> Option<&'a Guardrails> {
        self.custom_guardrails
            .as_ref()
            .or_else(|| domain.and_then(|pack| pack.guardrails.as_ref()))
    }

    pub fn tool_override(&self, tool_name: &str) -> Option<&ToolOverride> {
        self.tool_overrides
            .iter()
            .find(|entry| entry.tool_name == tool_name)
    }
}

/// Registry of registered packs keyed by `(tenant scope, domain, version)`
/// with a latest-pointer per `(tenant scope, domain)`.
#[derive(Debug, Default)]
pub struct PackRegistry {
    domain_packs: DashMap<(String, String), DomainPack>,
    latest_domain: DashMap<String, String>,
    tenant_packs: DashMap<String, TenantPolicyPack>,
}

impl PackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_domain_pack(&self, pack: DomainPack) -> Result<(), PackError> {
        let key = (pack.domain.clone(), pack.version.clone());
        if self.domain_packs.contains_key(&key) {
            return Err(PackError::AlreadyRegistered {
                domain: pack.domain,
                version: pack.version,
                scope: "global".to_string(),
            });
        }
        self.latest_domain
            .insert(pack.domain.clone(), pack.version.clone());
        self.domain_packs.insert(key, pack);
        Ok(())
    }

    pub fn domain_pack(&self, domain: &str, version: Option<&str>) -> Option<DomainPack> {
        let version = match version {
            Some(version) => version.to_string(),
            None => self.latest_domain.get(domain)?.value().clone(),
        };
        self.domain_packs
            .get(&(domain.to_string(), version))
            .map(|entry| entry.value().clone())
    }

    pub fn register_tenant_policy(&self, pack: TenantPolicyPack) -> Result<(), PackError> {
        if self.tenant_packs.contains_key(&pack.tenant_id) {
            return Err(PackError::AlreadyRegistered {
                domain: pack.domain_name,
                version: "tenant-policy".to_string(),
                scope: pack.tenant_id,
            });
        }
        self.tenant_packs.insert(pack.tenant_id.clone(), pack);
        Ok(())
    }

    pub fn tenant_policy(&self, tenant_id: &str) -> Option<TenantPolicyPack> {
        self.tenant_packs
            .get(tenant_id)
            .map(|entry| entry.value().clone())
    }

    /// Domain pack effective for a tenant (latest version of the domain the
    /// tenant policy names).
    pub fn domain_pack_for_tenant(&self, tenant_id: &str) -> Option<DomainPack> {
        let policy = self.tenant_policy(tenant_id)?;
        self.domain_pack(&policy.domain_name, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_domain_pack(version: &str) -> DomainPack {
        serde_json::from_value(json!({
            "domain": "billing",
            "version": version,
            "exceptionTypes": ["DataQualityFailure"],
            "severityRules": [{"exceptionType": "DataQualityFailure", "severity": "MEDIUM"}],
            "guardrails": {"allowLists": [], "blockLists": ["DELETE_ACCOUNT"], "humanApprovalThreshold": 0.8},
        }))
        .unwrap()
    }

    #[test]
    fn registry_keeps_latest_pointer() {
        let registry = PackRegistry::new();
        registry.register_domain_pack(sample_domain_pack("1")).unwrap();
        registry.register_domain_pack(sample_domain_pack("2")).unwrap();
        assert_eq!(registry.domain_pack("billing", None).unwrap().version, "2");
        assert_eq!(
            registry.domain_pack("billing", Some("1")).unwrap().version,
            "1"
        );
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let registry = PackRegistry::new();
        registry.register_domain_pack(sample_domain_pack("1")).unwrap();
        assert!(registry.register_domain_pack(sample_domain_pack("1")).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<TenantPolicyPack, _> = serde_json::from_value(json!({
            "tenantId": "t1",
            "domainName": "billing",
            "surprise": true,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn tenant_guardrails_override_domain() {
        let domain = sample_domain_pack("1");
        let tenant: TenantPolicyPack = serde_json::from_value(json!({
            "tenantId": "t1",
            "domainName": "billing",
            "customGuardrails": {"allowLists": [], "blockLists": [], "humanApprovalThreshold": 0.9},
        }))
        .unwrap();
        let effective = tenant.effective_guardrails(Some(&domain)).unwrap();
        assert_eq!(effective.human_approval_threshold, 0.9);
    }
}
