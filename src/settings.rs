// =============================================================================
// Process settings -- loaded once from the environment at startup
// =============================================================================

use anyhow::{bail, Result};

/// Immutable process configuration. Runtime-tunable evaluation parameters
/// live in `RuntimeConfig` (store-persisted); this struct only carries what
/// must be known before the first connection is made.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Shared secret expected in every webhook payload.
    pub tv_webhook_secret: String,
    /// Token expected in the `X-Admin-Token` header on admin endpoints.
    pub admin_token: String,

    pub redis_url: String,

    /// "dummy" or "openai".
    pub ai_provider: String,
    pub ai_api_key: String,
    pub ai_model: String,
    pub ai_base_url: String,

    pub log_level: String,
    pub log_json: bool,
    pub app_env: String,

    pub rate_limit_window_sec: u64,
    pub rate_limit_max_events: u32,

    pub bind_addr: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Read settings from the environment. The two secrets are mandatory; an
    /// unset or empty value aborts startup rather than running open.
    pub fn from_env() -> Result<Self> {
        let tv_webhook_secret = env_or("TV_WEBHOOK_SECRET", "");
        if tv_webhook_secret.is_empty() {
            bail!("TV_WEBHOOK_SECRET must be set");
        }
        let admin_token = env_or("ADMIN_TOKEN", "");
        if admin_token.is_empty() {
            bail!("ADMIN_TOKEN must be set");
        }

        Ok(Self {
            tv_webhook_secret,
            admin_token,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            ai_provider: env_or("AI_PROVIDER", "dummy"),
            ai_api_key: env_or("AI_API_KEY", ""),
            ai_model: env_or("AI_MODEL", "gpt-4o-mini"),
            ai_base_url: env_or("AI_BASE_URL", "https://api.openai.com/v1"),
            log_level: env_or("LOG_LEVEL", "info"),
            log_json: env_parse("LOG_JSON", true),
            app_env: env_or("APP_ENV", "production"),
            rate_limit_window_sec: env_parse("RATE_LIMIT_WINDOW_SEC", 10),
            rate_limit_max_events: env_parse("RATE_LIMIT_MAX_EVENTS", 30),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
        })
    }

    /// Defaults mirroring the test environment of the original service.
    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            tv_webhook_secret: "test_secret".to_string(),
            admin_token: "test_admin".to_string(),
            redis_url: "redis://localhost:6379/1".to_string(),
            ai_provider: "dummy".to_string(),
            ai_api_key: String::new(),
            ai_model: "gpt-4o-mini".to_string(),
            ai_base_url: "https://api.openai.com/v1".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            app_env: "test".to_string(),
            rate_limit_window_sec: 10,
            rate_limit_max_events: 30,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}
