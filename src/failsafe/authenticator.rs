use crate::auth::{bearer_token, IdentityVerifier};
use crate::authz::headers::{csrf_matches, validate_origin, OriginCheck};
use crate::authz::policy::{AuthMode, EndpointPolicy, KeyScope};
use crate::authz::profile::{check_admin, check_subscription, load_profile, QuotaGrant, UserProfile};
use crate::clock::Clock;
use crate::config::{FailsafeConfig, SecurityConfig};
use crate::crypto::constant_time_eq;
use crate::domain::{SecurityEvent, SecurityEventType, Severity};
use crate::errors::{AppError, ErrorKind, IdentityFailure};
use crate::failsafe::sanitize::sanitize_error_message;
use crate::failsafe::state::{AuthState, AuthStateMachine};
use crate::failsafe::CircuitBreaker;
use crate::monitor::SecurityMonitor;
use crate::observability::MetricsRecorder;
use crate::rate_limit::{
    ActivityKind, DenyReason, DistributedRateLimiter, RateLimitDecision, RateLimitRequest,
};
use crate::store::DocumentStore;
use axum::extract::Query;
use axum::http::{header, HeaderMap, Method, Uri};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
const ANONYMOUS_USER: &str = "anonymous";

/// Everything the authenticator looks at, captured before any handler runs
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: String,
    pub body: Bytes,
}

impl RequestContext {
    fn path(&self) -> &str {
        self.uri.path()
    }

    fn user_agent(&self) -> Option<String> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// `userId` claimed by the query string or a JSON body
    fn declared_user_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(&self.uri) {
            if let Some(uid) = params.get("userId") {
                ids.push(uid.clone());
            }
        }
        if !self.body.is_empty() {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&self.body) {
                match map.get("userId") {
                    Some(serde_json::Value::String(uid)) => ids.push(uid.clone()),
                    Some(serde_json::Value::Null) | None => {}
                    // A non-string userId can never match
                    Some(other) => ids.push(other.to_string()),
                }
            }
        }
        ids
    }
}

/// The caller as established by the authenticator
#[derive(Debug, Clone)]
pub struct Principal {
    /// Verified user; `None` on public and webhook endpoints
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub client_ip: String,
    pub profile: Option<UserProfile>,
    pub quota: Option<QuotaGrant>,
}

impl Principal {
    pub fn require_user(&self) -> Result<&str, AppError> {
        self.user_id
            .as_deref()
            .ok_or(AppError::Identity(IdentityFailure::Missing))
    }
}

/// Terminal result of authenticating one request
#[derive(Debug)]
pub struct AuthOutcome {
    pub state: AuthState,
    pub result: Result<Principal, AppError>,
    pub origin: OriginCheck,
    /// Window decision when a rate limit was evaluated
    pub rate_limit: Option<RateLimitDecision>,
}

impl AuthOutcome {
    /// Access requires `Authenticated` and a principal; anything else denies
    pub fn into_result(self) -> Result<Principal, AppError> {
        match (self.state, self.result) {
            (AuthState::Authenticated, Ok(principal)) => Ok(principal),
            (_, Err(e)) => Err(e),
            (state, Ok(_)) => Err(AppError::SystemDenial(format!(
                "principal produced in state {}",
                state
            ))),
        }
    }
}

/// Facts gathered while the pipeline runs, kept even when it is cut short
#[derive(Debug, Default)]
struct Progress {
    user_id: Option<String>,
    rate_limit: Option<RateLimitDecision>,
    fraud_locked_now: bool,
}

/// Fail-safe orchestration of method, origin, circuit, partition probe,
/// rate limit, identity, email, admin, subscription, CSRF and user-id
/// checks. The first failure ends the request and produces exactly one
/// security event.
pub struct RequestAuthenticator {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<DistributedRateLimiter>,
    verifier: Arc<IdentityVerifier>,
    monitor: Arc<SecurityMonitor>,
    clock: Arc<dyn Clock>,
    security: SecurityConfig,
    failsafe: FailsafeConfig,
    webhook_secret: String,
    probe_timeout: Duration,
}

impl RequestAuthenticator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<DistributedRateLimiter>,
        verifier: Arc<IdentityVerifier>,
        monitor: Arc<SecurityMonitor>,
        clock: Arc<dyn Clock>,
        security: SecurityConfig,
        failsafe: FailsafeConfig,
        webhook_secret: String,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            limiter,
            verifier,
            monitor,
            clock,
            security,
            failsafe,
            webhook_secret,
            probe_timeout,
        }
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    #[tracing::instrument(skip_all, fields(endpoint = policy.name, client_ip = %ctx.client_ip))]
    pub async fn authenticate(&self, policy: &EndpointPolicy, ctx: &RequestContext) -> AuthOutcome {
        let started = Instant::now();
        let origin = validate_origin(&ctx.headers, &self.security.allowed_origins);
        let mut machine = AuthStateMachine::new();
        machine.transition(AuthState::Validating);

        let mut progress = Progress::default();
        let budget = self.failsafe.request_budget();
        let result = match tokio::time::timeout(
            budget,
            self.run_checks(policy, ctx, &origin, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::SystemDenial(format!(
                "authentication exceeded the {}ms budget",
                budget.as_millis()
            ))),
        };

        let state = match &result {
            Ok(_) => machine.transition(AuthState::Authenticated),
            Err(e) if matches!(e.kind(), ErrorKind::Infra | ErrorKind::Config) => {
                machine.transition(AuthState::Error)
            }
            Err(_) => machine.transition(AuthState::Denied),
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(principal) => {
                MetricsRecorder::record_auth_decision(state.as_str(), "OK", elapsed);
                tracing::debug!(user_id = ?principal.user_id, "Request authenticated");
            }
            Err(e) => {
                MetricsRecorder::record_auth_decision(state.as_str(), e.code(), elapsed);
                tracing::warn!(state = %state, code = e.code(), path = %ctx.path(), "Request denied");
                self.emit_denial(policy, ctx, &progress, e).await;
            }
        }

        AuthOutcome {
            state,
            result,
            origin,
            rate_limit: progress.rate_limit,
        }
    }

    async fn run_checks(
        &self,
        policy: &EndpointPolicy,
        ctx: &RequestContext,
        origin: &OriginCheck,
        progress: &mut Progress,
    ) -> Result<Principal, AppError> {
        if !policy.allows_method(&ctx.method) {
            return Err(AppError::MethodNotAllowed);
        }

        match origin {
            OriginCheck::Allowed(_) => {}
            OriginCheck::Absent if policy.allow_missing_origin => {}
            OriginCheck::Absent | OriginCheck::Denied(_) => return Err(AppError::OriginDenied),
        }

        if policy.auth != AuthMode::Public && self.breaker.is_open().await {
            return Err(AppError::CircuitOpen);
        }

        if policy.auth != AuthMode::Public {
            self.probe_store().await?;
        }

        if policy.scope == KeyScope::IpEndpoint {
            let key = format!("{}:{}", ctx.client_ip, ctx.path());
            self.enforce_limit(policy, ctx, key, None, progress).await?;
        }

        let mut principal = Principal {
            user_id: None,
            email: None,
            client_ip: ctx.client_ip.clone(),
            profile: None,
            quota: None,
        };

        match policy.auth {
            AuthMode::Public => return Ok(principal),
            AuthMode::WebhookSecret => {
                self.check_webhook_secret(&ctx.headers)?;
                return Ok(principal);
            }
            AuthMode::Bearer => {}
        }

        let claims = match self.verify_bearer(ctx).await {
            Ok(claims) => claims,
            Err(e) => {
                if policy.rule.is_payment() {
                    self.record_failed_payment_auth(ctx).await;
                }
                return Err(e);
            }
        };
        progress.user_id = Some(claims.uid.clone());
        principal.user_id = Some(claims.uid.clone());
        principal.email = claims.email.clone();

        if policy.scope == KeyScope::IpUser {
            let key = format!("{}:{}", ctx.client_ip, claims.uid);
            self.enforce_limit(policy, ctx, key, Some(claims.uid.clone()), progress)
                .await?;
        }

        if !claims.email_verified {
            return Err(AppError::Identity(IdentityFailure::EmailNotVerified));
        }

        if policy.require_admin || policy.require_subscription {
            principal.profile = load_profile(self.store.as_ref(), &claims.uid)
                .await
                .map_err(|e| AppError::SystemDenial(format!("profile lookup failed: {}", e)))?;
        }

        if policy.require_admin {
            check_admin(
                principal.profile.as_ref(),
                claims.email.as_deref(),
                &self.security.admin_email,
            )?;
        }

        if policy.require_subscription {
            principal.quota = Some(check_subscription(principal.profile.as_ref())?);
        }

        if policy.needs_csrf(&ctx.method)
            && !csrf_matches(
                &ctx.headers,
                &self.security.csrf_header_name,
                &self.security.csrf_cookie_name,
            )
        {
            return Err(AppError::CsrfMismatch);
        }

        if policy.check_user_id
            && ctx
                .declared_user_ids()
                .iter()
                .any(|declared| declared != &claims.uid)
        {
            return Err(AppError::UserIdMismatch);
        }

        Ok(principal)
    }

    /// Short store read before any heavy work
    async fn probe_store(&self) -> Result<(), AppError> {
        match tokio::time::timeout(self.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Store probe failed");
                Err(AppError::PartitionDetected)
            }
            Err(_) => {
                tracing::error!(timeout_ms = self.probe_timeout.as_millis() as u64, "Store probe timed out");
                Err(AppError::PartitionDetected)
            }
        }
    }

    async fn enforce_limit(
        &self,
        policy: &EndpointPolicy,
        ctx: &RequestContext,
        key: String,
        user_id: Option<String>,
        progress: &mut Progress,
    ) -> Result<(), AppError> {
        let request = RateLimitRequest {
            rule: policy.rule.clone(),
            key,
            client_ip: ctx.client_ip.clone(),
            user_id,
            endpoint: ctx.path().to_string(),
            user_agent: ctx.user_agent(),
        };
        let decision = self.limiter.check_rate_limit(&request).await;
        progress.fraud_locked_now = decision.fraud.map_or(false, |f| f.newly_locked);
        let outcome = limit_error(&decision);
        progress.rate_limit = Some(decision);
        match outcome {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_webhook_secret(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let presented = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if self.webhook_secret.is_empty()
            || presented.is_empty()
            || !constant_time_eq(presented, &self.webhook_secret)
        {
            return Err(AppError::WebhookUnauthorized);
        }
        Ok(())
    }

    async fn verify_bearer(&self, ctx: &RequestContext) -> Result<crate::auth::IdTokenClaims, AppError> {
        let authorization = ctx
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = bearer_token(authorization).map_err(AppError::Identity)?;
        self.verifier.verify(token).await
    }

    async fn record_failed_payment_auth(&self, ctx: &RequestContext) {
        if let Err(e) = self
            .limiter
            .fraud()
            .record_activity(&ctx.client_ip, ANONYMOUS_USER, ctx.path(), ActivityKind::FailedAuth)
            .await
        {
            tracing::error!(error = %e, "Failed to record failed payment authentication");
        }
    }

    /// The single security event for a denied request
    async fn emit_denial(
        &self,
        policy: &EndpointPolicy,
        ctx: &RequestContext,
        progress: &Progress,
        error: &AppError,
    ) {
        let (event_type, severity) = if progress.fraud_locked_now {
            (SecurityEventType::PaymentFraudDetected, Severity::Critical)
        } else {
            denial_event(error)
        };

        let mut event = SecurityEvent::new(event_type, severity, self.clock.now())
            .with_client_ip(ctx.client_ip.clone())
            .with_user(progress.user_id.clone())
            .with_endpoint(ctx.path())
            .with_reason(error.code())
            .with_payload(serde_json::json!({
                "policy": policy.name,
                "method": ctx.method.as_str(),
                "detail": sanitize_error_message(&error.to_string(), self.failsafe.max_error_message_length),
            }));
        if let Some(decision) = &progress.rate_limit {
            if let Some(fraud) = decision.fraud {
                event.payload["riskScore"] = serde_json::json!(fraud.risk_score);
            }
            event.payload["failsafeMode"] = serde_json::json!(decision.failsafe_mode);
        }

        if let Err(e) = self.monitor.record_security_event(event).await {
            tracing::error!(error = %e, "Failed to record denial security event");
        }
    }
}

/// Map a window decision onto the error a client sees
fn limit_error(decision: &RateLimitDecision) -> Option<AppError> {
    if decision.allowed {
        return None;
    }
    let retry_after_secs = decision.retry_after_secs().unwrap_or(1);
    Some(match decision.reason {
        Some(DenyReason::FraudLockout) => AppError::FraudLockout { retry_after_secs },
        Some(DenyReason::StoreUnavailable) => AppError::ServiceUnavailable,
        Some(DenyReason::SystemError) => AppError::SystemError,
        Some(DenyReason::WindowExhausted) | Some(DenyReason::FailsafeExhausted) | None => {
            AppError::RateLimited {
                retry_after_secs,
                remaining: decision.remaining,
            }
        }
    })
}

/// Event type and severity recorded for a denial
pub fn denial_event(error: &AppError) -> (SecurityEventType, Severity) {
    let event_type = match error {
        AppError::Identity(IdentityFailure::ReplayDetected) => SecurityEventType::TokenReplayDetected,
        AppError::Identity(IdentityFailure::VerificationTimeout) => {
            SecurityEventType::VerificationTimeout
        }
        AppError::Identity(_) => SecurityEventType::AuthFailure,
        AppError::WebhookUnauthorized => SecurityEventType::WebhookAbuse,
        AppError::OriginDenied => SecurityEventType::OriginDenied,
        AppError::CsrfMismatch => SecurityEventType::CsrfViolation,
        AppError::UserIdMismatch => SecurityEventType::UserIdMismatch,
        AppError::AdminRequired => SecurityEventType::AdminAccessViolation,
        AppError::MethodNotAllowed => SecurityEventType::SuspiciousActivity,
        AppError::RateLimited { .. } | AppError::FraudLockout { .. } => {
            SecurityEventType::RateLimitExceeded
        }
        AppError::UsageLimitExceeded | AppError::SubscriptionRequired => {
            SecurityEventType::QuotaDenied
        }
        AppError::CircuitOpen => SecurityEventType::CircuitOpen,
        AppError::PartitionDetected => SecurityEventType::PartitionDetected,
        _ => SecurityEventType::SystemError,
    };

    let severity = if error.is_critical() {
        Severity::Critical
    } else {
        match error.kind() {
            ErrorKind::Policy | ErrorKind::Infra | ErrorKind::Config => Severity::High,
            ErrorKind::Identity | ErrorKind::Quota => Severity::Medium,
            ErrorKind::Input => Severity::Low,
        }
    };
    let severity = match error {
        AppError::UsageLimitExceeded | AppError::SubscriptionRequired => Severity::Low,
        _ => severity,
    };

    (event_type, severity)
}
