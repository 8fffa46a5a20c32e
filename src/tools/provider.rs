use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config;
use crate::db::tool_definitions::ToolDefinitionRow;
use crate::tools::definition::{is_http_family, AuthType, ToolConfig};
use crate::tools::security::{self, UrlValidationError};

const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ToolProviderError {
    #[error("authentication failed for tool '{tool}': {reason}")]
    Auth { tool: String, reason: String },
    #[error("tool '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: f64 },
    #[error("URL validation failed for tool '{tool}': {source}")]
    UrlValidation {
        tool: String,
        #[source]
        source: UrlValidationError,
    },
    #[error("tool '{tool}' returned status {status}: {body}")]
    Http {
        tool: String,
        status: u16,
        body: String,
    },
    #[error("request error for tool '{tool}': {reason}")]
    Request { tool: String, reason: String },
    #[error("invalid tool definition for '{tool}': {reason}")]
    Definition { tool: String, reason: String },
}

impl ToolProviderError {
    /// Transient errors increment the circuit breaker and are retried;
    /// validation and auth errors are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolProviderError::Timeout { .. }
                | ToolProviderError::Request { .. }
                | ToolProviderError::Http { status: 500..=599, .. }
        )
    }
}

/// Per-invocation knobs, sourced from tenant tool overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderOptions {
    pub timeout_seconds: Option<f64>,
    pub max_retries: Option<u32>,
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn supports_tool_type(&self, tool_type: &str) -> bool;

    async fn execute(
        &self,
        tool: &ToolDefinitionRow,
        tool_config: &ToolConfig,
        payload: &Value,
        options: &ProviderOptions,
    ) -> Result<Value, ToolProviderError>;
}

/// Executor for http/rest/webhook tools. One shared client safe for
/// concurrent use; URL allow-list enforced before any dispatch; auth
/// injected from environment secrets and never logged raw.
pub struct HttpToolProvider {
    client: Client,
    retry_delay: Duration,
}

impl HttpToolProvider {
    pub fn new() -> Self {
        Self::with_retry_delay(Duration::from_millis(DEFAULT_RETRY_DELAY_MS))
    }

    pub fn with_retry_delay(retry_delay: Duration) -> Self {
        Self {
            client: Client::builder()
                .build()
                .expect("http provider client build"),
            retry_delay,
        }
    }

    fn build_headers(
        &self,
        tool: &ToolDefinitionRow,
        tool_config: &ToolConfig,
    ) -> Result<Vec<(String, String)>, ToolProviderError> {
        let mut headers: Vec<(String, String)> = tool_config
            .endpoint_config
            .as_ref()
            .map(|endpoint| {
                endpoint
                    .headers
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        match tool_config.auth_type {
            AuthType::ApiKey => {
                let api_key = config::tool_api_key(&tool.name, tool.tenant_id.as_deref())
                    .ok_or_else(|| ToolProviderError::Auth {
                        tool: tool.name.clone(),
                        reason: "API key required but not found in environment".to_string(),
                    })?;
                headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
            }
            AuthType::OauthStub => {
                headers.push((
                    "Authorization".to_string(),
                    "Bearer stub_oauth_token".to_string(),
                ));
            }
            AuthType::None => {}
        }

        if !headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        Ok(headers)
    }
}

impl Default for HttpToolProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn query_params(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl ToolProvider for HttpToolProvider {
    fn supports_tool_type(&self, tool_type: &str) -> bool {
        is_http_family(tool_type)
    }

    async fn execute(
        &self,
        tool: &ToolDefinitionRow,
        tool_config: &ToolConfig,
        payload: &Value,
        options: &ProviderOptions,
    ) -> Result<Value, ToolProviderError> {
        let endpoint = tool_config
            .endpoint_config
            .as_ref()
            .ok_or_else(|| ToolProviderError::Definition {
                tool: tool.name.clone(),
                reason: "http-family tool missing endpointConfig".to_string(),
            })?;

        security::validate_url_from_env(&endpoint.url).map_err(|source| {
            ToolProviderError::UrlValidation {
                tool: tool.name.clone(),
                source,
            }
        })?;

        let method = endpoint.method.to_uppercase();
        let timeout_seconds = options
            .timeout_seconds
            .or(endpoint.timeout_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let timeout = Duration::from_secs_f64(timeout_seconds.max(0.001));
        let max_retries = options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let headers = self.build_headers(tool, tool_config)?;
        let masked_headers = security::mask_headers(&headers);
        let redacted_payload = security::redact_secrets(payload);

        let mut last_error: Option<ToolProviderError> = None;
        for attempt in 0..=max_retries {
            tracing::debug!(
                tool = %tool.name,
                attempt = attempt + 1,
                method = %method,
                url = %endpoint.url,
                headers = ?masked_headers,
                payload = %redacted_payload,
                "dispatching http tool"
            );

            let reqwest_method = method
                .parse::<reqwest::Method>()
                .map_err(|_| ToolProviderError::Definition {
                    tool: tool.name.clone(),
                    reason: format!("unsupported HTTP method '{method}'"),
                })?;
            let mut request = self
                .client
                .request(reqwest_method, &endpoint.url)
                .timeout(timeout);
            for (key, value) in &headers {
                request = request.header(key.as_str(), value.as_str());
            }
            request = match method.as_str() {
                "POST" | "PUT" | "PATCH" => request.json(payload),
                "GET" => request.query(&query_params(payload)),
                _ => request.json(payload),
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let provider_error = if err.is_timeout() {
                        ToolProviderError::Timeout {
                            tool: tool.name.clone(),
                            seconds: timeout_seconds,
                        }
                    } else {
                        ToolProviderError::Request {
                            tool: tool.name.clone(),
                            reason: err.to_string(),
                        }
                    };
                    if attempt < max_retries {
                        tracing::warn!(tool = %tool.name, attempt = attempt + 1, error = %provider_error, "retrying http tool");
                        last_error = Some(provider_error);
                        tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                        continue;
                    }
                    return Err(provider_error);
                }
            };

            let status = response.status();
            if status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let result = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
                    json!({"raw_response": text, "status_code": status.as_u16()})
                });
                tracing::info!(
                    tool = %tool.name,
                    status = status.as_u16(),
                    response = %security::redact_secrets(&result),
                    "http tool succeeded"
                );
                return Ok(result);
            }

            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(200).collect::<String>();
            if code == 401 || code == 403 {
                return Err(ToolProviderError::Auth {
                    tool: tool.name.clone(),
                    reason: format!("status {code}"),
                });
            }
            let http_error = ToolProviderError::Http {
                tool: tool.name.clone(),
                status: code,
                body,
            };
            // 5xx is retryable; all 4xx (including 408/429) are not.
            if code >= 500 && attempt < max_retries {
                tracing::warn!(tool = %tool.name, status = code, attempt = attempt + 1, "server error, retrying");
                last_error = Some(http_error);
                tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                continue;
            }
            return Err(http_error);
        }

        Err(last_error.unwrap_or_else(|| ToolProviderError::Request {
            tool: tool.name.clone(),
            reason: "retries exhausted".to_string(),
        }))
    }
}

/// Fallback provider for every non-HTTP type: honors a configured delay and
/// echoes its inputs back.
pub struct DummyToolProvider {
    delay: Duration,
}

impl DummyToolProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for DummyToolProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl ToolProvider for DummyToolProvider {
    fn supports_tool_type(&self, _tool_type: &str) -> bool {
        true
    }

    async fn execute(
        &self,
        tool: &ToolDefinitionRow,
        _tool_config: &ToolConfig,
        payload: &Value,
        _options: &ProviderOptions,
    ) -> Result<Value, ToolProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({
            "status": "ok",
            "tool": tool.name,
            "tool_type": tool.tool_type,
            "echo": payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dummy_tool() -> ToolDefinitionRow {
        ToolDefinitionRow {
            tool_id: 1,
            tenant_id: None,
            name: "echo".to_string(),
            tool_type: "dummy".to_string(),
            config: json!({"description": "echo"}),
        }
    }

    #[tokio::test]
    async fn dummy_provider_echoes_payload() {
        let provider = DummyToolProvider::new(Duration::from_millis(1));
        let config = ToolConfig::parse("dummy", &json!({"description": "echo"})).unwrap();
        let output = provider
            .execute(
                &dummy_tool(),
                &config,
                &json!({"ticket": 42}),
                &ProviderOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(output["echo"]["ticket"], 42);
        assert_eq!(output["status"], "ok");
    }

    #[test]
    fn transient_classification() {
        let timeout = ToolProviderError::Timeout {
            tool: "t".into(),
            seconds: 1.0,
        };
        let server = ToolProviderError::Http {
            tool: "t".into(),
            status: 503,
            body: String::new(),
        };
        let client = ToolProviderError::Http {
            tool: "t".into(),
            status: 404,
            body: String::new(),
        };
        let auth = ToolProviderError::Auth {
            tool: "t".into(),
            reason: "status 401".into(),
        };
        assert!(timeout.is_transient());
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!auth.is_transient());
    }

    #[test]
    fn get_params_render_scalars() {
        let params = query_params(&json!({"service": "billing", "count": 3}));
        assert!(params.contains(&("service".to_string(), "billing".to_string())));
        assert!(params.contains(&("count".to_string(), "3".to_string())));
    }
}
