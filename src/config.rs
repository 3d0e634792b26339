use crate::errors::{AppError, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Frozen process configuration.
///
/// Every section rejects unknown keys so that a typo in a deployment file
/// fails startup instead of silently falling back to a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub identity: IdentityConfig,
    pub firebase_public: FirebasePublicConfig,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub failsafe: FailsafeConfig,
    pub security: SecurityConfig,
    pub llm: LlmConfig,
    pub payment: PaymentConfig,
    pub email: EmailConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: String,
    pub redis_url: String,
    pub redis_key_prefix: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub operation_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub ttl_sweep_interval_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            database_url: String::new(),
            redis_url: String::new(),
            redis_key_prefix: "scribe".to_string(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_seconds: 2,
            operation_timeout_ms: 2_000,
            probe_timeout_ms: 500,
            ttl_sweep_interval_seconds: 300,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Identity provider admin credentials and token hygiene limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    pub jwks_url: String,
    pub token_uri: String,
    pub account_lookup_url: String,
    pub verification_timeout_ms: u64,
    pub max_token_age_seconds: i64,
    pub max_session_age_seconds: i64,
    pub min_token_length: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            client_email: String::new(),
            private_key: String::new(),
            jwks_url: "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            account_lookup_url: "https://identitytoolkit.googleapis.com/v1/projects/{project_id}/accounts:lookup".to_string(),
            verification_timeout_ms: 3_000,
            max_token_age_seconds: 3_600,
            max_session_age_seconds: 86_400,
            min_token_length: 100,
        }
    }
}

impl IdentityConfig {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    pub fn issuer(&self) -> String {
        format!("https://securetoken.google.com/{}", self.project_id)
    }
}

/// Client-side identity provider configuration served to browsers
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirebasePublicConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RuleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitRules {
    pub generate: RuleConfig,
    pub auth: RuleConfig,
    pub payment: RuleConfig,
    pub webhook: RuleConfig,
    pub admin: RuleConfig,
    pub public: RuleConfig,
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            generate: RuleConfig { max_requests: 30, window_seconds: 60 },
            auth: RuleConfig { max_requests: 20, window_seconds: 60 },
            payment: RuleConfig { max_requests: 3, window_seconds: 300 },
            webhook: RuleConfig { max_requests: 30, window_seconds: 60 },
            admin: RuleConfig { max_requests: 60, window_seconds: 60 },
            public: RuleConfig { max_requests: 60, window_seconds: 60 },
        }
    }
}

/// Fraud scoring policy. Weights are configuration, not law.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FraudConfig {
    pub suspicious_pattern_window_seconds: i64,
    pub rapid_attempt_window_seconds: i64,
    pub lockout_duration_seconds: i64,
    pub payment_attempt_weight: u32,
    pub failed_auth_weight: u32,
    pub rapid_request_bonus: u32,
    pub endpoint_diversity_bonus: u32,
    pub regular_interval_bonus: u32,
    pub lock_threshold: u32,
    pub max_activities: usize,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            suspicious_pattern_window_seconds: 3_600,
            rapid_attempt_window_seconds: 300,
            lockout_duration_seconds: 3_600,
            payment_attempt_weight: 30,
            failed_auth_weight: 15,
            rapid_request_bonus: 25,
            endpoint_diversity_bonus: 20,
            regular_interval_bonus: 15,
            lock_threshold: 100,
            max_activities: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Process-wide secret mixed into every hashed document key
    pub secret: String,
    pub max_transaction_retries: u32,
    pub max_requests_per_entry: usize,
    pub entry_ttl_buffer_seconds: i64,
    pub failsafe_max_requests: u32,
    pub replay_window_seconds: i64,
    pub max_token_usage: u32,
    pub rules: RateLimitRules,
    pub fraud: FraudConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            max_transaction_retries: 3,
            max_requests_per_entry: 1_000,
            entry_ttl_buffer_seconds: 300,
            failsafe_max_requests: 3,
            replay_window_seconds: 300,
            max_token_usage: 1,
            rules: RateLimitRules::default(),
            fraud: FraudConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventLogConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub channel_buffer_size: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 1_000,
            channel_buffer_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub short_term_window_seconds: i64,
    pub long_term_window_seconds: i64,
    pub max_events_per_entry: usize,
    pub threat_window_seconds: i64,
    pub failed_auth_alert_threshold: usize,
    pub rate_limit_alert_threshold: usize,
    pub suspicious_alert_threshold: usize,
    pub alert_ttl_days: i64,
    pub alert_idle_resolve_seconds: i64,
    pub event_log: EventLogConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            short_term_window_seconds: 300,
            long_term_window_seconds: 86_400,
            max_events_per_entry: 200,
            threat_window_seconds: 86_400,
            failed_auth_alert_threshold: 5,
            rate_limit_alert_threshold: 10,
            suspicious_alert_threshold: 3,
            alert_ttl_days: 30,
            alert_idle_resolve_seconds: 3_600,
            event_log: EventLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailsafeConfig {
    pub request_budget_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_open_ms: i64,
    pub max_error_message_length: usize,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            request_budget_ms: 4_500,
            circuit_failure_threshold: 5,
            circuit_open_ms: 30_000,
            max_error_message_length: 200,
        }
    }
}

impl FailsafeConfig {
    pub fn request_budget(&self) -> Duration {
        Duration::from_millis(self.request_budget_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_email: String,
    pub site_url: String,
    pub csrf_header_name: String,
    pub csrf_cookie_name: String,
    pub device_signup_cookie: String,
    pub device_signup_max_age_days: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            admin_email: String::new(),
            site_url: String::new(),
            csrf_header_name: "x-csrf-token".to_string(),
            csrf_cookie_name: "csrf_token".to_string(),
            device_signup_cookie: "device_signup".to_string(),
            device_signup_max_age_days: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30_000,
            max_tokens: 800,
        }
    }
}

/// Payment processor plan identifiers per tier and billing cycle
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanIds {
    pub starter_monthly: String,
    pub starter_yearly: String,
    pub professional_monthly: String,
    pub professional_yearly: String,
    pub enterprise_monthly: String,
    pub enterprise_yearly: String,
}

impl PlanIds {
    /// Look up the plan id for a `<tier>_<cycle>` plan name
    pub fn lookup(&self, plan_name: &str) -> Option<&str> {
        let id = match plan_name {
            "starter_monthly" => &self.starter_monthly,
            "starter_yearly" => &self.starter_yearly,
            "professional_monthly" => &self.professional_monthly,
            "professional_yearly" => &self.professional_yearly,
            "enterprise_monthly" => &self.enterprise_monthly,
            "enterprise_yearly" => &self.enterprise_yearly,
            _ => return None,
        };
        (!id.is_empty()).then_some(id.as_str())
    }

    fn all(&self) -> [(&'static str, &str); 6] {
        [
            ("starter_monthly", &self.starter_monthly),
            ("starter_yearly", &self.starter_yearly),
            ("professional_monthly", &self.professional_monthly),
            ("professional_yearly", &self.professional_yearly),
            ("enterprise_monthly", &self.enterprise_monthly),
            ("enterprise_yearly", &self.enterprise_yearly),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaymentConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub webhook_secret: String,
    pub timeout_ms: u64,
    pub plans: PlanIds,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: "https://api-m.sandbox.paypal.com".to_string(),
            webhook_secret: String::new(),
            timeout_ms: 10_000,
            plans: PlanIds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    /// Domains accepted for admin-entered emails; empty accepts any domain
    pub allowed_domains: Vec<String>,
    pub mx_lookup_enabled: bool,
    pub mx_lookup_url: String,
    pub mx_lookup_timeout_ms: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            mx_lookup_enabled: true,
            mx_lookup_url: "https://dns.google/resolve".to_string(),
            mx_lookup_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let environment =
            env::var("SCRIBE_GATE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::File::with_name(&format!("config/{}", environment)).required(false),
            )
            // e.g., SCRIBE_GATE__SECURITY__ADMIN_EMAIL=owner@example.com
            .add_source(
                config::Environment::with_prefix("SCRIBE_GATE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.allowed_origins")
                    .with_list_parse_key("email.allowed_domains")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Configuration(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Configuration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Configuration("Invalid port number".to_string()));
        }

        match self.store.backend {
            StoreBackend::Postgres if self.store.database_url.is_empty() => {
                return Err(AppError::Configuration(
                    "store.database_url is required for the postgres backend".to_string(),
                ));
            }
            StoreBackend::Redis if self.store.redis_url.is_empty() => {
                return Err(AppError::Configuration(
                    "store.redis_url is required for the redis backend".to_string(),
                ));
            }
            _ => {}
        }

        if self.rate_limit.secret.len() < 32 {
            return Err(AppError::Configuration(
                "rate_limit.secret must be at least 32 characters long".to_string(),
            ));
        }

        if self.rate_limit.max_token_usage == 0 || self.rate_limit.replay_window_seconds <= 0 {
            return Err(AppError::Configuration(
                "Token replay window and usage limit must be positive".to_string(),
            ));
        }

        if self.rate_limit.failsafe_max_requests > 3 {
            return Err(AppError::Configuration(
                "rate_limit.failsafe_max_requests may not exceed 3".to_string(),
            ));
        }

        let rules = &self.rate_limit.rules;
        for (name, rule) in [
            ("generate", rules.generate),
            ("auth", rules.auth),
            ("payment", rules.payment),
            ("webhook", rules.webhook),
            ("admin", rules.admin),
            ("public", rules.public),
        ] {
            if rule.max_requests == 0 || rule.window_seconds == 0 {
                return Err(AppError::Configuration(format!(
                    "rate_limit.rules.{} must have a positive limit and window",
                    name
                )));
            }
            // A window trimmed below its limit can never fill
            if (rule.max_requests as usize) > self.rate_limit.max_requests_per_entry {
                return Err(AppError::Configuration(format!(
                    "rate_limit.max_requests_per_entry ({}) is below rate_limit.rules.{}.max_requests ({})",
                    self.rate_limit.max_requests_per_entry, name, rule.max_requests
                )));
            }
        }

        if self.identity.project_id.is_empty() {
            return Err(AppError::Configuration(
                "identity.project_id is required".to_string(),
            ));
        }

        if self.security.admin_email.is_empty() {
            return Err(AppError::Configuration(
                "security.admin_email is required".to_string(),
            ));
        }

        if let Some(origin) = self
            .security
            .allowed_origins
            .iter()
            .find(|origin| !origin.starts_with("https://"))
        {
            return Err(AppError::Configuration(format!(
                "Allowed origin must use HTTPS: {}",
                origin
            )));
        }

        if let Some((name, _)) = self
            .payment
            .plans
            .all()
            .into_iter()
            .find(|(_, id)| id.is_empty())
        {
            return Err(AppError::Configuration(format!(
                "Misconfigured plan: payment.plans.{} is not set",
                name
            )));
        }

        if self.failsafe.request_budget_ms == 0 || self.failsafe.circuit_failure_threshold == 0 {
            return Err(AppError::Configuration(
                "Fail-safe budget and circuit threshold must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration suitable for tests and local development with the
    /// in-memory store.
    pub fn development() -> Self {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.rate_limit.secret = "development-secret-value-at-least-32-chars".to_string();
        config.identity.project_id = "scribe-dev".to_string();
        config.security.admin_email = "admin@example.com".to_string();
        config.security.allowed_origins = vec!["https://app.example.com".to_string()];
        config.security.site_url = "https://app.example.com".to_string();
        config.email.mx_lookup_enabled = false;
        config.payment.webhook_secret = "development-webhook-secret".to_string();
        config.payment.plans = PlanIds {
            starter_monthly: "P-STARTER-M".to_string(),
            starter_yearly: "P-STARTER-Y".to_string(),
            professional_monthly: "P-PRO-M".to_string(),
            professional_yearly: "P-PRO-Y".to_string(),
            enterprise_monthly: "P-ENT-M".to_string(),
            enterprise_yearly: "P-ENT-Y".to_string(),
        };
        config
    }
}
