use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolConfigError {
    #[error("invalid tool config: {0}")]
    Invalid(String),
    #[error("tool type '{tool_type}' requires endpointConfig")]
    MissingEndpoint { tool_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    ApiKey,
    OauthStub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantScope {
    Global,
    #[default]
    Tenant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Parsed view of the `config` JSONB column on a tool definition. Accepts
/// both camelCase and snake_case field names for backward compatibility
/// with earlier registrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub description: String,
    #[serde(default, alias = "input_schema")]
    pub input_schema: Option<Value>,
    #[serde(default, alias = "output_schema")]
    pub output_schema: Option<Value>,
    #[serde(default, alias = "auth_type")]
    pub auth_type: AuthType,
    #[serde(default, alias = "endpoint_config")]
    pub endpoint_config: Option<EndpointConfig>,
    #[serde(default, alias = "tenant_scope")]
    pub tenant_scope: TenantScope,
}

pub fn is_http_family(tool_type: &str) -> bool {
    matches!(
        tool_type.to_lowercase().as_str(),
        "http" | "https" | "rest" | "webhook"
    )
}

impl ToolConfig {
    /// Parse and validate a tool config against its declared type. HTTP-family
    /// tools must carry an endpoint config.
    pub fn parse(tool_type: &str, config: &Value) -> Result<Self, ToolConfigError> {
        let parsed: ToolConfig = serde_json::from_value(config.clone())
            .map_err(|err| ToolConfigError::Invalid(err.to_string()))?;
        if parsed.description.trim().is_empty() {
            return Err(ToolConfigError::Invalid(
                "description must be non-empty".to_string(),
            ));
        }
        if is_http_family(tool_type) && parsed.endpoint_config.is_none() {
            return Err(ToolConfigError::MissingEndpoint {
                tool_type: tool_type.to_string(),
            });
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_tool_requires_endpoint() {
        let config = json!({
            "description": "restart a service",
            "inputSchema": {"type": "object"},
            "outputSchema": {"type": "object"},
            "authType": "api_key",
        });
        let err = ToolConfig::parse("http", &config).unwrap_err();
        assert!(matches!(err, ToolConfigError::MissingEndpoint { .. }));
        assert!(ToolConfig::parse("dummy", &config).is_ok());
    }

    #[test]
    fn accepts_snake_case_aliases() {
        let config = json!({
            "description": "legacy registration",
            "input_schema": {"type": "object"},
            "auth_type": "oauth_stub",
            "endpoint_config": {"url": "https://api.example.com/hook"},
        });
        let parsed = ToolConfig::parse("webhook", &config).unwrap();
        assert_eq!(parsed.auth_type, AuthType::OauthStub);
        let endpoint = parsed.endpoint_config.unwrap();
        assert_eq!(endpoint.method, "POST");
        assert_eq!(endpoint.url, "https://api.example.com/hook");
    }

    #[test]
    fn empty_description_rejected() {
        let config = json!({"description": "  "});
        assert!(ToolConfig::parse("dummy", &config).is_err());
    }
}
