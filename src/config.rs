use serde::Deserialize;

/// Per-source toggles and credentials loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceToggle {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl SourceToggle {
    fn from_env(code: &str, default_enabled: bool) -> Self {
        let prefix = code.to_uppercase();
        Self {
            enabled: env_bool(&format!("ENABLE_SOURCE_{}", prefix), default_enabled),
            api_key: std::env::var(format!("{}_API_KEY", prefix)).ok(),
            api_secret: std::env::var(format!("{}_API_SECRET", prefix)).ok(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

/// Consolidation deadline budget.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationConfig {
    pub timeout_global_secs: u64,
    pub timeout_per_source_secs: u64,
    pub fail_on_all_errors: bool,
    pub dedup_strategy: String,
    pub max_concurrent_sources: usize,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub database_url: String,
    /// Absent → all Redis-dependent features fall back in-process.
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    /// 64-char hex AES-256 key for OAuth token encryption.
    pub encryption_key: Option<String>,
    pub sentry_dsn: Option<String>,

    pub admin_user_ids: Vec<String>,

    // sources
    pub pncp: SourceToggle,
    pub portal_compras: SourceToggle,
    pub licitar: SourceToggle,
    pub compras_gov: SourceToggle,
    pub portal_transparencia_api_key: Option<String>,

    // timeout chain (seconds)
    pub pncp_timeout_per_uf_secs: u64,
    pub pncp_timeout_per_uf_degraded_secs: u64,
    pub consolidation: ConsolidationConfig,
    pub search_fetch_timeout_secs: u64,

    // llm arbiter
    pub llm_arbiter_enabled: bool,
    pub llm_arbiter_model: String,
    pub llm_arbiter_max_tokens: u32,
    pub llm_arbiter_temperature: f32,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,

    // rate limiting
    pub rate_limiting_enabled: bool,
    pub search_rate_limit_per_minute: u32,
    pub login_rate_limit_per_window: u32,
    pub sse_connection_cap: usize,
}

/// The frontend proxy deadline is owned by the frontend deployment; it is
/// asserted here only so the timeout-chain invariant can be checked at
/// startup.
pub const FE_PROXY_TIMEOUT_SECS: u64 = 480;

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

    let encryption_key = std::env::var("ENCRYPTION_KEY").ok().filter(|k| !k.is_empty());
    if environment == "production" && encryption_key.is_none() {
        anyhow::bail!(
            "ENCRYPTION_KEY is required in production. \
             Set a 64-char hex key before starting the server."
        );
    }

    let admin_user_ids = std::env::var("ADMIN_USER_IDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect();

    Ok(Config {
        port: env_parse("PORT", 8000),
        environment,
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/bidiq".into()),
        redis_url: std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
        jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".into()),
        encryption_key,
        sentry_dsn: std::env::var("SENTRY_DSN").ok(),
        admin_user_ids,

        // Open-data sources default on; credentialed sources default off.
        pncp: SourceToggle::from_env("PNCP", true),
        portal_compras: SourceToggle::from_env("PORTAL_COMPRAS", false),
        licitar: SourceToggle::from_env("LICITAR", false),
        compras_gov: SourceToggle::from_env("COMPRAS_GOV", true),
        portal_transparencia_api_key: std::env::var("PORTAL_TRANSPARENCIA_API_KEY").ok(),

        pncp_timeout_per_uf_secs: env_parse("PNCP_TIMEOUT_PER_UF", 90),
        pncp_timeout_per_uf_degraded_secs: env_parse("PNCP_TIMEOUT_PER_UF_DEGRADED", 120),
        consolidation: ConsolidationConfig {
            timeout_global_secs: env_parse("CONSOLIDATION_TIMEOUT_GLOBAL", 300),
            timeout_per_source_secs: env_parse("CONSOLIDATION_TIMEOUT_PER_SOURCE", 180),
            fail_on_all_errors: env_bool("CONSOLIDATION_FAIL_ON_ALL", true),
            dedup_strategy: std::env::var("CONSOLIDATION_DEDUP_STRATEGY")
                .unwrap_or_else(|_| "first_seen".into()),
            max_concurrent_sources: env_parse("CONSOLIDATION_MAX_CONCURRENT", 5),
        },
        search_fetch_timeout_secs: env_parse("SEARCH_FETCH_TIMEOUT", 360),

        llm_arbiter_enabled: env_bool("LLM_ARBITER_ENABLED", true),
        llm_arbiter_model: std::env::var("LLM_ARBITER_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".into()),
        llm_arbiter_max_tokens: env_parse("LLM_ARBITER_MAX_TOKENS", 1),
        llm_arbiter_temperature: env_parse("LLM_ARBITER_TEMPERATURE", 0.0),
        openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
        openai_base_url: std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into()),

        rate_limiting_enabled: env_bool("RATE_LIMITING_ENABLED", true),
        search_rate_limit_per_minute: env_parse("SEARCH_RATE_LIMIT_PER_MINUTE", 10),
        login_rate_limit_per_window: env_parse("LOGIN_RATE_LIMIT", 5),
        sse_connection_cap: env_parse("SSE_CONNECTION_CAP", 3),
    })
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
