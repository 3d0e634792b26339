//! Validation of emails entered through the admin console.

use crate::config::EmailConfig;
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const MX_RECORD_TYPE: u16 = 15;

static EMAIL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("email pattern compiles")
});

/// Answers whether a domain publishes mail exchangers
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn has_mx_records(&self, domain: &str) -> Result<bool>;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DohResponse {
    #[serde(default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
}

/// MX lookup over a DNS-over-HTTPS JSON resolver
pub struct DohMxResolver {
    url: String,
    http: reqwest::Client,
}

impl DohMxResolver {
    pub fn new(config: &EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_millis(config.mx_lookup_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: config.mx_lookup_url.clone(),
            http,
        }
    }
}

#[async_trait]
impl MxResolver for DohMxResolver {
    async fn has_mx_records(&self, domain: &str) -> Result<bool> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("name", domain), ("type", "MX")])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                MetricsRecorder::record_external_call("mx_lookup", "error");
                AppError::InvalidEmail(format!("could not verify mail domain: {}", e))
            })?;

        let body = response
            .json::<DohResponse>()
            .await
            .map_err(|e| AppError::InvalidEmail(format!("could not verify mail domain: {}", e)))?;
        MetricsRecorder::record_external_call("mx_lookup", "ok");

        Ok(body.answer.iter().any(|a| a.record_type == MX_RECORD_TYPE))
    }
}

pub struct EmailValidator {
    allowed_domains: Vec<String>,
    resolver: Option<Arc<dyn MxResolver>>,
}

impl EmailValidator {
    pub fn new(config: &EmailConfig, resolver: Option<Arc<dyn MxResolver>>) -> Self {
        Self {
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect(),
            resolver,
        }
    }

    /// Validator with the DoH resolver when lookups are enabled
    pub fn from_config(config: &EmailConfig) -> Self {
        let resolver: Option<Arc<dyn MxResolver>> = if config.mx_lookup_enabled {
            Some(Arc::new(DohMxResolver::new(config)))
        } else {
            None
        };
        Self::new(config, resolver)
    }

    /// Check format, domain allow-list and, when configured, MX records.
    /// Returns the normalized (trimmed, lower-case) address.
    pub async fn validate(&self, email: &str) -> Result<String> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() {
            return Err(AppError::InvalidEmail("email is required".to_string()));
        }
        if email.len() > 254 || !EMAIL_FORMAT.is_match(&email) {
            return Err(AppError::InvalidEmail("malformed address".to_string()));
        }

        let domain = email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_string())
            .ok_or_else(|| AppError::InvalidEmail("malformed address".to_string()))?;

        if !self.allowed_domains.is_empty() && !self.allowed_domains.contains(&domain) {
            return Err(AppError::InvalidEmail(format!("domain {} is not accepted", domain)));
        }

        if let Some(resolver) = &self.resolver {
            if !resolver.has_mx_records(&domain).await? {
                return Err(AppError::InvalidEmail(format!("domain {} does not accept mail", domain)));
            }
        }

        Ok(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(bool);

    #[async_trait]
    impl MxResolver for FixedResolver {
        async fn has_mx_records(&self, _domain: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn config(domains: &[&str]) -> EmailConfig {
        EmailConfig {
            allowed_domains: domains.iter().map(|d| d.to_string()).collect(),
            mx_lookup_enabled: false,
            ..EmailConfig::default()
        }
    }

    #[tokio::test]
    async fn test_format() {
        let validator = EmailValidator::new(&config(&[]), None);
        assert_eq!(validator.validate(" User@Example.com ").await.unwrap(), "user@example.com");
        assert!(validator.validate("no-at-sign").await.is_err());
        assert!(validator.validate("a@b.c").await.is_err());
        assert!(validator.validate("").await.is_err());
    }

    #[tokio::test]
    async fn test_allow_list() {
        let validator = EmailValidator::new(&config(&["example.com"]), None);
        assert!(validator.validate("a@example.com").await.is_ok());
        assert!(matches!(
            validator.validate("a@other.com").await,
            Err(AppError::InvalidEmail(_))
        ));
    }

    #[tokio::test]
    async fn test_mx_lookup() {
        let with_mx = EmailValidator::new(&config(&[]), Some(Arc::new(FixedResolver(true))));
        assert!(with_mx.validate("a@example.com").await.is_ok());

        let without_mx = EmailValidator::new(&config(&[]), Some(Arc::new(FixedResolver(false))));
        assert!(without_mx.validate("a@example.com").await.is_err());
    }

    #[test]
    fn test_doh_answer_parsing() {
        let body: DohResponse = serde_json::from_str(
            r#"{"Status":0,"Answer":[{"name":"example.com.","type":15,"TTL":300,"data":"10 mx.example.com."}]}"#,
        )
        .unwrap();
        assert!(body.answer.iter().any(|a| a.record_type == MX_RECORD_TYPE));

        let empty: DohResponse = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert!(empty.answer.is_empty());
    }
}
