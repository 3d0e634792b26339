use crate::store::Document;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of security-relevant events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    AuthFailure,
    RateLimitExceeded,
    SuspiciousActivity,
    TokenReplayDetected,
    PaymentFraudDetected,
    WebhookAbuse,
    AdminAccessViolation,
    OriginDenied,
    CsrfViolation,
    UserIdMismatch,
    VerificationTimeout,
    CircuitOpen,
    PartitionDetected,
    QuotaDenied,
    SystemError,
}

/// Bucket an event falls into for alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    FailedAuth,
    RateLimit,
    Suspicious,
    Other,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::AuthFailure => "auth_failure",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::TokenReplayDetected => "token_replay_detected",
            SecurityEventType::PaymentFraudDetected => "payment_fraud_detected",
            SecurityEventType::WebhookAbuse => "webhook_abuse",
            SecurityEventType::AdminAccessViolation => "admin_access_violation",
            SecurityEventType::OriginDenied => "origin_denied",
            SecurityEventType::CsrfViolation => "csrf_violation",
            SecurityEventType::UserIdMismatch => "user_id_mismatch",
            SecurityEventType::VerificationTimeout => "verification_timeout",
            SecurityEventType::CircuitOpen => "circuit_open",
            SecurityEventType::PartitionDetected => "partition_detected",
            SecurityEventType::QuotaDenied => "quota_denied",
            SecurityEventType::SystemError => "system_error",
        }
    }

    pub fn family(&self) -> EventFamily {
        match self {
            SecurityEventType::AuthFailure => EventFamily::FailedAuth,
            SecurityEventType::RateLimitExceeded => EventFamily::RateLimit,
            SecurityEventType::SuspiciousActivity
            | SecurityEventType::OriginDenied
            | SecurityEventType::CsrfViolation
            | SecurityEventType::UserIdMismatch => EventFamily::Suspicious,
            _ => EventFamily::Other,
        }
    }

    /// Contribution to an identifier's threat score
    pub fn threat_score(&self, severity: Severity) -> u32 {
        match self {
            SecurityEventType::AuthFailure => 15,
            SecurityEventType::RateLimitExceeded => 10,
            SecurityEventType::PaymentFraudDetected => 40,
            SecurityEventType::TokenReplayDetected => 30,
            SecurityEventType::WebhookAbuse => 20,
            _ if severity == Severity::Critical => 50,
            SecurityEventType::SuspiciousActivity
            | SecurityEventType::OriginDenied
            | SecurityEventType::CsrfViolation
            | SecurityEventType::UserIdMismatch => 25,
            _ => 5,
        }
    }

    /// How long the raw event is kept
    pub fn retention(&self, severity: Severity) -> Duration {
        if severity == Severity::Critical {
            return Duration::days(90);
        }
        match self {
            SecurityEventType::AuthFailure
            | SecurityEventType::TokenReplayDetected
            | SecurityEventType::VerificationTimeout
            | SecurityEventType::AdminAccessViolation => Duration::days(30),
            SecurityEventType::RateLimitExceeded => Duration::days(7),
            _ => Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Append-only security event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub event_id: String,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub reason: Option<String>,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, now: DateTime<Utc>) -> Self {
        Self {
            event_id: crate::crypto::new_id(),
            event_type,
            severity,
            timestamp: now,
            client_ip: None,
            user_id: None,
            endpoint: None,
            reason: None,
            payload: serde_json::json!({}),
            expires_at: now + event_type.retention(severity),
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Identifier the threat level is tracked under: the user when known,
    /// else the client address
    pub fn threat_identifier(&self) -> Option<String> {
        match (&self.user_id, &self.client_ip) {
            (Some(uid), _) => Some(format!("user:{}", uid)),
            (None, Some(ip)) => Some(format!("ip:{}", ip)),
            (None, None) => None,
        }
    }

    pub fn score(&self) -> u32 {
        self.event_type.threat_score(self.severity)
    }
}

impl Document for SecurityEvent {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Medium => "MEDIUM",
            AlertLevel::High => "HIGH",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

/// Threat category derived from a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatCategory {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatCategory {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=24 => ThreatCategory::Low,
            25..=49 => ThreatCategory::Medium,
            50..=99 => ThreatCategory::High,
            _ => ThreatCategory::Critical,
        }
    }
}
