use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

use crate::failsafe::sanitize_error_message;
use crate::store::StoreError;

const MAX_PUBLIC_MESSAGE_LENGTH: usize = 200;

/// Stable machine-readable error codes returned in the `code` field
pub mod codes {
    pub const TOKEN_MISSING: &str = "TOKEN_MISSING";
    pub const TOKEN_MALFORMED: &str = "TOKEN_MALFORMED";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const TOKEN_TOO_OLD: &str = "TOKEN_TOO_OLD";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const INVALID_AUDIENCE: &str = "INVALID_AUDIENCE";
    pub const VERIFICATION_TIMEOUT: &str = "VERIFICATION_TIMEOUT";
    pub const TOKEN_REPLAY_DETECTED: &str = "TOKEN_REPLAY_DETECTED";
    pub const EMAIL_NOT_VERIFIED: &str = "EMAIL_NOT_VERIFIED";
    pub const ADMIN_REQUIRED: &str = "ADMIN_REQUIRED";
    pub const ORIGIN_DENIED: &str = "ORIGIN_DENIED";
    pub const CSRF_MISMATCH: &str = "CSRF_MISMATCH";
    pub const USER_ID_MISMATCH: &str = "USER_ID_MISMATCH";
    pub const WEBHOOK_UNAUTHORIZED: &str = "WEBHOOK_UNAUTHORIZED";
    pub const METHOD_NOT_ALLOWED: &str = "METHOD_NOT_ALLOWED";
    pub const USAGE_LIMIT_EXCEEDED: &str = "USAGE_LIMIT_EXCEEDED";
    pub const SUBSCRIPTION_REQUIRED: &str = "SUBSCRIPTION_REQUIRED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const FRAUD_LOCKOUT: &str = "FRAUD_LOCKOUT";
    pub const SYSTEM_ERROR: &str = "SYSTEM_ERROR";
    pub const SYSTEM_ERROR_DENIAL: &str = "SYSTEM_ERROR_DENIAL";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const PARTITION_DETECTED: &str = "PARTITION_DETECTED";
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const INVALID_EMAIL: &str = "INVALID_EMAIL";
    pub const USER_EXISTS: &str = "USER_EXISTS";
    pub const DEVICE_ALREADY_REGISTERED: &str = "DEVICE_ALREADY_REGISTERED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const LLM_ERROR: &str = "LLM_ERROR";
    pub const PAYMENT_ERROR: &str = "PAYMENT_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Identity failure kinds produced by token verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityFailure {
    Missing,
    Malformed,
    Expired,
    Revoked,
    Invalid,
    InvalidAudience,
    TooOld,
    SessionExpired,
    VerificationTimeout,
    ReplayDetected,
    EmailNotVerified,
}

impl IdentityFailure {
    pub fn code(&self) -> &'static str {
        match self {
            IdentityFailure::Missing => codes::TOKEN_MISSING,
            IdentityFailure::Malformed => codes::TOKEN_MALFORMED,
            IdentityFailure::Expired => codes::TOKEN_EXPIRED,
            IdentityFailure::Revoked => codes::TOKEN_REVOKED,
            IdentityFailure::Invalid => codes::TOKEN_INVALID,
            IdentityFailure::InvalidAudience => codes::INVALID_AUDIENCE,
            IdentityFailure::TooOld => codes::TOKEN_TOO_OLD,
            IdentityFailure::SessionExpired => codes::SESSION_EXPIRED,
            IdentityFailure::VerificationTimeout => codes::VERIFICATION_TIMEOUT,
            IdentityFailure::ReplayDetected => codes::TOKEN_REPLAY_DETECTED,
            IdentityFailure::EmailNotVerified => codes::EMAIL_NOT_VERIFIED,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            IdentityFailure::Missing => "Authentication required",
            IdentityFailure::Malformed => "Malformed authentication token",
            IdentityFailure::Expired => "Authentication token expired",
            IdentityFailure::Revoked => "Authentication token revoked",
            IdentityFailure::Invalid => "Invalid authentication token",
            IdentityFailure::InvalidAudience => "Invalid authentication token",
            IdentityFailure::TooOld => "Authentication token too old, please refresh",
            IdentityFailure::SessionExpired => "Session expired, please sign in again",
            IdentityFailure::VerificationTimeout => "Authentication could not be verified",
            IdentityFailure::ReplayDetected => "Authentication token already used",
            IdentityFailure::EmailNotVerified => "Email address not verified",
        }
    }
}

/// Top-level grouping of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Identity,
    Policy,
    Quota,
    Infra,
    Config,
}

/// Application-wide error type
#[derive(Debug)]
pub enum AppError {
    // Input errors
    InvalidInput(String),
    InvalidEmail(String),
    NotFound(String),
    UserExists,
    DeviceAlreadyRegistered,

    // Identity errors
    Identity(IdentityFailure),
    WebhookUnauthorized,

    // Policy errors
    MethodNotAllowed,
    OriginDenied,
    CsrfMismatch,
    UserIdMismatch,
    AdminRequired,

    // Quota errors
    UsageLimitExceeded,
    SubscriptionRequired,
    RateLimited {
        retry_after_secs: u64,
        remaining: u32,
    },
    FraudLockout {
        retry_after_secs: u64,
    },

    // Infrastructure errors
    Store(StoreError),
    CircuitOpen,
    PartitionDetected,
    ServiceUnavailable,
    SystemError,
    SystemDenial(String),
    Llm(String),
    Payment(String),

    // Configuration errors
    Configuration(String),

    // Internal errors
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidInput(_)
            | AppError::InvalidEmail(_)
            | AppError::NotFound(_)
            | AppError::UserExists
            | AppError::DeviceAlreadyRegistered => ErrorKind::Input,
            AppError::Identity(_) | AppError::WebhookUnauthorized => ErrorKind::Identity,
            AppError::MethodNotAllowed
            | AppError::OriginDenied
            | AppError::CsrfMismatch
            | AppError::UserIdMismatch
            | AppError::AdminRequired => ErrorKind::Policy,
            AppError::UsageLimitExceeded
            | AppError::SubscriptionRequired
            | AppError::RateLimited { .. }
            | AppError::FraudLockout { .. } => ErrorKind::Quota,
            AppError::Store(_)
            | AppError::CircuitOpen
            | AppError::PartitionDetected
            | AppError::ServiceUnavailable
            | AppError::SystemError
            | AppError::SystemDenial(_)
            | AppError::Llm(_)
            | AppError::Payment(_)
            | AppError::Internal(_) => ErrorKind::Infra,
            AppError::Configuration(_) => ErrorKind::Config,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::InvalidEmail(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UserExists | AppError::DeviceAlreadyRegistered => StatusCode::CONFLICT,
            AppError::Identity(IdentityFailure::EmailNotVerified) => StatusCode::FORBIDDEN,
            AppError::Identity(IdentityFailure::VerificationTimeout) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Identity(_) | AppError::WebhookUnauthorized => StatusCode::UNAUTHORIZED,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::OriginDenied
            | AppError::CsrfMismatch
            | AppError::UserIdMismatch
            | AppError::AdminRequired
            | AppError::UsageLimitExceeded
            | AppError::SubscriptionRequired => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } | AppError::FraudLockout { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::Store(e) if e.is_unreachable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CircuitOpen
            | AppError::PartitionDetected
            | AppError::ServiceUnavailable
            | AppError::SystemError
            | AppError::SystemDenial(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Llm(_) | AppError::Payment(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) | AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => codes::INVALID_INPUT,
            AppError::InvalidEmail(_) => codes::INVALID_EMAIL,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::UserExists => codes::USER_EXISTS,
            AppError::DeviceAlreadyRegistered => codes::DEVICE_ALREADY_REGISTERED,
            AppError::Identity(failure) => failure.code(),
            AppError::WebhookUnauthorized => codes::WEBHOOK_UNAUTHORIZED,
            AppError::MethodNotAllowed => codes::METHOD_NOT_ALLOWED,
            AppError::OriginDenied => codes::ORIGIN_DENIED,
            AppError::CsrfMismatch => codes::CSRF_MISMATCH,
            AppError::UserIdMismatch => codes::USER_ID_MISMATCH,
            AppError::AdminRequired => codes::ADMIN_REQUIRED,
            AppError::UsageLimitExceeded => codes::USAGE_LIMIT_EXCEEDED,
            AppError::SubscriptionRequired => codes::SUBSCRIPTION_REQUIRED,
            AppError::RateLimited { .. } => codes::RATE_LIMITED,
            AppError::FraudLockout { .. } => codes::FRAUD_LOCKOUT,
            AppError::Store(_) | AppError::ServiceUnavailable => codes::SERVICE_UNAVAILABLE,
            AppError::CircuitOpen => codes::CIRCUIT_OPEN,
            AppError::PartitionDetected => codes::PARTITION_DETECTED,
            AppError::SystemError => codes::SYSTEM_ERROR,
            AppError::SystemDenial(_) => codes::SYSTEM_ERROR_DENIAL,
            AppError::Llm(_) => codes::LLM_ERROR,
            AppError::Payment(_) => codes::PAYMENT_ERROR,
            AppError::Configuration(_) | AppError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Seconds a client should wait before retrying, for retryable kinds
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            AppError::FraudLockout { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Kinds that are always reported at CRITICAL severity
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AppError::Identity(IdentityFailure::VerificationTimeout)
                | AppError::Identity(IdentityFailure::ReplayDetected)
                | AppError::CircuitOpen
                | AppError::FraudLockout { .. }
                | AppError::AdminRequired
                | AppError::UserIdMismatch
        )
    }

    /// Client-facing message. Stable per kind and free of internal detail.
    pub fn public_message(&self) -> String {
        match self {
            AppError::InvalidInput(msg) => msg.clone(),
            AppError::InvalidEmail(reason) => format!("Invalid email: {}", reason),
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::UserExists => "User already exists".to_string(),
            AppError::DeviceAlreadyRegistered => {
                "A trial has already been created from this device".to_string()
            }
            AppError::Identity(failure) => failure.message().to_string(),
            AppError::WebhookUnauthorized => "Unauthorized".to_string(),
            AppError::MethodNotAllowed => "Method not allowed".to_string(),
            AppError::OriginDenied => "Origin not allowed".to_string(),
            AppError::CsrfMismatch => "CSRF token missing or invalid".to_string(),
            AppError::UserIdMismatch => "User ID does not match authenticated user".to_string(),
            AppError::AdminRequired => "Admin access required".to_string(),
            AppError::UsageLimitExceeded => "Monthly usage limit reached".to_string(),
            AppError::SubscriptionRequired => "An active subscription is required".to_string(),
            AppError::RateLimited { .. } => "Too many requests".to_string(),
            AppError::FraudLockout { .. } => {
                "Too many suspicious requests, access temporarily locked".to_string()
            }
            AppError::Store(_)
            | AppError::CircuitOpen
            | AppError::PartitionDetected
            | AppError::ServiceUnavailable
            | AppError::SystemError
            | AppError::SystemDenial(_) => "Service temporarily unavailable".to_string(),
            AppError::Llm(_) => "Description generation failed".to_string(),
            AppError::Payment(_) => "Payment processor request failed".to_string(),
            AppError::Configuration(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            AppError::InvalidEmail(msg) => write!(f, "Invalid email: {}", msg),
            AppError::NotFound(what) => write!(f, "{} not found", what),
            AppError::UserExists => write!(f, "User already exists"),
            AppError::DeviceAlreadyRegistered => write!(f, "Device already registered a trial"),
            AppError::Identity(failure) => write!(f, "Identity failure: {}", failure.code()),
            AppError::WebhookUnauthorized => write!(f, "Webhook secret mismatch"),
            AppError::MethodNotAllowed => write!(f, "Method not allowed"),
            AppError::OriginDenied => write!(f, "Origin denied"),
            AppError::CsrfMismatch => write!(f, "CSRF token mismatch"),
            AppError::UserIdMismatch => write!(f, "User id mismatch"),
            AppError::AdminRequired => write!(f, "Admin access required"),
            AppError::UsageLimitExceeded => write!(f, "Usage limit exceeded"),
            AppError::SubscriptionRequired => write!(f, "Subscription required"),
            AppError::RateLimited { retry_after_secs, .. } => {
                write!(f, "Rate limit exceeded (retry after {}s)", retry_after_secs)
            }
            AppError::FraudLockout { retry_after_secs } => {
                write!(f, "Fraud lockout (retry after {}s)", retry_after_secs)
            }
            AppError::Store(e) => write!(f, "Store error: {}", e),
            AppError::CircuitOpen => write!(f, "Circuit breaker open"),
            AppError::PartitionDetected => write!(f, "Store partition detected"),
            AppError::ServiceUnavailable => write!(f, "Service unavailable"),
            AppError::SystemError => write!(f, "System error"),
            AppError::SystemDenial(msg) => write!(f, "System error denial: {}", msg),
            AppError::Llm(msg) => write!(f, "LLM error: {}", msg),
            AppError::Payment(msg) => write!(f, "Payment error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<crate::external::ExternalError> for AppError {
    fn from(err: crate::external::ExternalError) -> Self {
        use crate::external::ExternalError;
        match err {
            ExternalError::Llm(msg) => AppError::Llm(msg),
            ExternalError::Payment(msg) => AppError::Payment(msg),
            ExternalError::NotConfigured(what) => {
                AppError::Configuration(format!("{} is not configured", what))
            }
        }
    }
}

/// JSON error envelope returned to clients
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub timestamp: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self.kind() {
            ErrorKind::Infra | ErrorKind::Config => {
                tracing::error!(code = self.code(), error = %self, "Request failed");
            }
            _ => {
                tracing::debug!(code = self.code(), error = %self, "Request rejected");
            }
        }

        let envelope = ErrorEnvelope {
            error: sanitize_error_message(&self.public_message(), MAX_PUBLIC_MESSAGE_LENGTH),
            code: Some(self.code()),
            retry_after: self.retry_after(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut response = (status, Json(envelope)).into_response();

        if let Some(retry_after) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        if let AppError::RateLimited { remaining, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                response.headers_mut().insert("x-ratelimit-remaining", value);
            }
        }
        if let AppError::FraudLockout { .. } = &self {
            response
                .headers_mut()
                .insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        }

        response
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;
