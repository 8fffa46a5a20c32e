use once_cell::sync::Lazy;

/// Address the API surface binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the API surface binds to. Defaults to `8080`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080)
});

/// Comma-separated host allow-list for HTTP tool endpoints. Unset means no
/// allow-list enforcement (dev only; production must set it).
pub static TOOL_ALLOWED_DOMAINS: Lazy<Option<Vec<String>>> = Lazy::new(|| {
    std::env::var("TOOL_ALLOWED_DOMAINS").ok().map(|raw| {
        raw.split(',')
            .map(|domain| domain.trim().to_string())
            .filter(|domain| !domain.is_empty())
            .collect()
    })
});

/// Comma-separated scheme allow-list for HTTP tool endpoints. Defaults to `https`.
pub static TOOL_ALLOWED_SCHEMES: Lazy<Vec<String>> = Lazy::new(|| {
    std::env::var("TOOL_ALLOWED_SCHEMES")
        .map(|raw| {
            raw.split(',')
                .map(|scheme| scheme.trim().to_lowercase())
                .filter(|scheme| !scheme.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| vec!["https".to_string()])
});

/// Seconds after which a `processing` ledger row is considered abandoned.
pub static LEDGER_STALE_SECONDS: Lazy<i64> = Lazy::new(|| {
    std::env::var("LEDGER_STALE_SECONDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(300)
});

/// Retry cap per `(event, worker)` before an event is routed to the DLQ.
pub static WORKER_MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("WORKER_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3)
});

/// Optional directory for the embedding disk cache.
pub static EMBEDDING_CACHE_DIR: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("EMBEDDING_CACHE_DIR").ok());

/// Directory for tenant-scoped violation journals.
pub static VIOLATION_LOG_DIR: Lazy<String> =
    Lazy::new(|| std::env::var("VIOLATION_LOG_DIR").unwrap_or_else(|_| "violations".to_string()));

pub fn tool_api_key(tool_name: &str, tenant_id: Option<&str>) -> Option<String> {
    let normalized_name = normalize_env_segment(tool_name);
    if let Some(tenant) = tenant_id {
        let tenant_var = format!(
            "TOOL_{}_{}_API_KEY",
            normalize_env_segment(tenant),
            normalized_name
        );
        if let Ok(key) = std::env::var(&tenant_var) {
            tracing::debug!(%tool_name, tenant = tenant, "using tenant-specific tool API key");
            return Some(key);
        }
    }
    let global_var = format!("TOOL_{normalized_name}_API_KEY");
    match std::env::var(&global_var) {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(%tool_name, env_var = %global_var, "tool API key not found");
            None
        }
    }
}

fn normalize_env_segment(value: &str) -> String {
    value.to_uppercase().replace(['-', '.', ' '], "_")
}
