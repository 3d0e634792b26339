use crate::clock::Clock;
use crate::config::{RateLimitConfig, RuleConfig};
use crate::crypto::hash_key;
use crate::observability::MetricsRecorder;
use crate::rate_limit::fallback::LocalFallbackWindow;
use crate::rate_limit::fraud::{ActivityKind, FraudAssessment, FraudDetector};
use crate::rate_limit::sliding_window::{
    count_in_window, evaluate, RateLimitEntry, RequestMetadata, WindowParams,
};
use crate::store::{
    collections, delete_doc, get_doc, update_doc, Change, DocumentStore, StoreError, StoreResult,
};
use std::sync::Arc;

/// A named limit: at most `max_requests` per `window_ms`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit_type: String,
    pub max_requests: u32,
    pub window_ms: i64,
}

impl RateLimitRule {
    pub fn new(limit_type: impl Into<String>, config: &RuleConfig) -> Self {
        Self {
            limit_type: limit_type.into(),
            max_requests: config.max_requests,
            window_ms: (config.window_seconds as i64) * 1_000,
        }
    }

    /// Authentication and payment windows never fail open
    pub fn is_privileged(&self) -> bool {
        let t = self.limit_type.as_str();
        t.starts_with("auth") || t.starts_with("admin") || t.contains("payment")
    }

    pub fn is_payment(&self) -> bool {
        self.limit_type.contains("payment")
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitRequest {
    pub rule: RateLimitRule,
    /// Caller-chosen key, e.g. `ip:endpoint` or `ip:user`
    pub key: String,
    pub client_ip: String,
    pub user_id: Option<String>,
    pub endpoint: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    WindowExhausted,
    FraudLockout,
    /// Store unreachable and the rule is privileged
    StoreUnavailable,
    /// Store unreachable and the local fallback allowance is used up
    FailsafeExhausted,
    /// Conflicts or unreadable state: deny rather than guess
    SystemError,
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix ms when the window frees up
    pub reset_time_ms: i64,
    pub retry_after_ms: Option<i64>,
    pub reason: Option<DenyReason>,
    /// Decided by the local fallback because the store was unreachable
    pub failsafe_mode: bool,
    pub fraud: Option<FraudAssessment>,
}

impl RateLimitDecision {
    fn deny(rule: &RateLimitRule, reason: DenyReason, now_ms: i64, retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            limit: rule.max_requests,
            remaining: 0,
            reset_time_ms: now_ms + retry_after_ms,
            retry_after_ms: Some(retry_after_ms),
            reason: Some(reason),
            failsafe_mode: false,
            fraud: None,
        }
    }

    /// Whole seconds to wait, rounded up, at least one when denied
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms
            .map(|ms| ((ms.max(0) as u64) + 999) / 1_000)
            .map(|secs| secs.max(1))
    }

    /// Unix seconds when the window frees up
    pub fn reset_secs(&self) -> i64 {
        (self.reset_time_ms + 999) / 1_000
    }
}

/// Sliding-window limiter whose state lives in the shared document store,
/// with fraud lockout for payment traffic.
pub struct DistributedRateLimiter {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    secret: String,
    max_retries: u32,
    max_entries: usize,
    ttl_buffer_ms: i64,
    fraud: Arc<FraudDetector>,
    fallback: LocalFallbackWindow,
}

impl DistributedRateLimiter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: &RateLimitConfig,
        fraud: Arc<FraudDetector>,
    ) -> Self {
        Self {
            store,
            clock,
            secret: config.secret.clone(),
            max_retries: config.max_transaction_retries,
            max_entries: config.max_requests_per_entry,
            ttl_buffer_ms: config.entry_ttl_buffer_seconds * 1_000,
            fraud,
            fallback: LocalFallbackWindow::new(config.failsafe_max_requests),
        }
    }

    pub fn fraud(&self) -> &Arc<FraudDetector> {
        &self.fraud
    }

    fn doc_id(&self, limit_type: &str, key: &str) -> String {
        hash_key(&self.secret, limit_type, key)
    }

    /// Check and record one request. Never errors: every failure becomes a
    /// denial with a reason, except the non-privileged fail-safe allowance.
    pub async fn check_rate_limit(&self, request: &RateLimitRequest) -> RateLimitDecision {
        let now_ms = self.clock.now_ms();
        let rule = &request.rule;

        if let Some(user_id) = &request.user_id {
            match self.fraud.lock_status(&request.client_ip, user_id).await {
                Ok(Some(until)) => {
                    MetricsRecorder::record_rate_limit_exceeded(&rule.limit_type, "fraud_lockout");
                    tracing::warn!(
                        client_ip = %request.client_ip,
                        user_id = %user_id,
                        locked_until = %until,
                        "Request rejected by fraud lockout"
                    );
                    let retry_after = (until.timestamp_millis() - now_ms).max(0);
                    return RateLimitDecision::deny(rule, DenyReason::FraudLockout, now_ms, retry_after);
                }
                Ok(None) => {}
                Err(e) => return self.on_store_error(request, e, now_ms),
            }
        }

        let id = self.doc_id(&rule.limit_type, &request.key);
        let params = WindowParams {
            max_requests: rule.max_requests,
            window_ms: rule.window_ms,
            max_entries: self.max_entries,
            ttl_buffer_ms: self.ttl_buffer_ms,
        };
        let metadata = RequestMetadata {
            client_ip: request.client_ip.clone(),
            user_id: request.user_id.clone(),
            user_agent: request.user_agent.clone(),
            endpoint: request.endpoint.clone(),
        };

        let result = update_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_REQUESTS,
            &id,
            self.max_retries,
            |current: Option<RateLimitEntry>| {
                let (entry, outcome) =
                    evaluate(current, &rule.limit_type, metadata.clone(), params, now_ms);
                Ok((Change::Put(entry), outcome))
            },
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.on_store_error(request, e, now_ms),
        };

        let mut decision = RateLimitDecision {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_time_ms: outcome.reset_time_ms,
            retry_after_ms: outcome.retry_after_ms,
            reason: (!outcome.allowed).then_some(DenyReason::WindowExhausted),
            failsafe_mode: false,
            fraud: None,
        };

        if !decision.allowed {
            MetricsRecorder::record_rate_limit_exceeded(&rule.limit_type, "window");
            tracing::warn!(
                limit_type = %rule.limit_type,
                client_ip = %request.client_ip,
                endpoint = %request.endpoint,
                current = outcome.current,
                limit = outcome.limit,
                "Rate limit exceeded"
            );

            if rule.is_payment() {
                if let Some(user_id) = &request.user_id {
                    match self
                        .fraud
                        .record_activity(
                            &request.client_ip,
                            user_id,
                            &request.endpoint,
                            ActivityKind::PaymentAttempt,
                        )
                        .await
                    {
                        Ok(assessment) => decision.fraud = Some(assessment),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to record payment fraud activity");
                        }
                    }
                }
            }
        }

        decision
    }

    fn on_store_error(&self, request: &RateLimitRequest, error: StoreError, now_ms: i64) -> RateLimitDecision {
        let rule = &request.rule;

        if !error.is_unreachable() {
            tracing::error!(
                limit_type = %rule.limit_type,
                error = %error,
                "Rate limit transaction failed, denying"
            );
            return RateLimitDecision::deny(rule, DenyReason::SystemError, now_ms, 1_000);
        }

        tracing::error!(
            limit_type = %rule.limit_type,
            error = %error,
            "Rate limit store unreachable, entering fail-safe mode"
        );

        if rule.is_privileged() {
            let mut decision =
                RateLimitDecision::deny(rule, DenyReason::StoreUnavailable, now_ms, rule.window_ms);
            decision.failsafe_mode = true;
            return decision;
        }

        let id = self.doc_id(&rule.limit_type, &request.key);
        match self.fallback.try_acquire(&id, rule.window_ms, now_ms) {
            Some(remaining) => RateLimitDecision {
                allowed: true,
                limit: self.fallback.max_requests(),
                remaining,
                reset_time_ms: now_ms + rule.window_ms,
                retry_after_ms: None,
                reason: None,
                failsafe_mode: true,
                fraud: None,
            },
            None => {
                let mut decision =
                    RateLimitDecision::deny(rule, DenyReason::FailsafeExhausted, now_ms, rule.window_ms);
                decision.limit = self.fallback.max_requests();
                decision.failsafe_mode = true;
                decision
            }
        }
    }

    /// Requests currently counted in a window
    pub async fn get_count(&self, rule: &RateLimitRule, key: &str) -> StoreResult<u32> {
        let entry: Option<RateLimitEntry> = get_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_REQUESTS,
            &self.doc_id(&rule.limit_type, key),
        )
        .await?;
        Ok(entry.map_or(0, |e| count_in_window(&e, rule.window_ms, self.clock.now_ms())))
    }

    /// Forget a window entirely
    pub async fn reset(&self, limit_type: &str, key: &str) -> StoreResult<bool> {
        let removed = delete_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_REQUESTS,
            &self.doc_id(limit_type, key),
        )
        .await?;
        tracing::info!(limit_type = %limit_type, "Rate limit reset");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::store::MemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        limiter: DistributedRateLimiter,
        config: Config,
    }

    fn fixture() -> Fixture {
        let config = Config::development();
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let fraud = Arc::new(FraudDetector::new(
            store.clone(),
            clock.clone(),
            config.rate_limit.secret.clone(),
            config.rate_limit.fraud.clone(),
            config.rate_limit.max_transaction_retries,
        ));
        let limiter = DistributedRateLimiter::new(store.clone(), clock.clone(), &config.rate_limit, fraud);
        Fixture {
            clock,
            store,
            limiter,
            config,
        }
    }

    fn request(rule: RateLimitRule, ip: &str, user: Option<&str>, endpoint: &str) -> RateLimitRequest {
        let key = match user {
            Some(u) => format!("{}:{}", ip, u),
            None => format!("{}:{}", ip, endpoint),
        };
        RateLimitRequest {
            rule,
            key,
            client_ip: ip.to_string(),
            user_id: user.map(str::to_string),
            endpoint: endpoint.to_string(),
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_generate_window_thirty_per_minute() {
        let f = fixture();
        let rule = RateLimitRule::new("generate", &f.config.rate_limit.rules.generate);
        let req = request(rule, "9.9.9.9", None, "/generate");

        let first_ms = f.clock.now_ms();
        for i in 0..30 {
            let decision = f.limiter.check_rate_limit(&req).await;
            assert!(decision.allowed, "request {} should be allowed", i + 1);
            f.clock.advance(chrono::Duration::milliseconds(300));
        }

        let decision = f.limiter.check_rate_limit(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::WindowExhausted));
        let expected = first_ms + 60_000 - f.clock.now_ms();
        assert_eq!(decision.retry_after_ms, Some(expected));

        f.clock.advance(chrono::Duration::seconds(60));
        assert!(f.limiter.check_rate_limit(&req).await.allowed);
    }

    #[tokio::test]
    async fn test_get_count_and_reset() {
        let f = fixture();
        let rule = RateLimitRule::new("public", &f.config.rate_limit.rules.public);
        let req = request(rule.clone(), "1.1.1.1", None, "/get-client-ip");

        f.limiter.check_rate_limit(&req).await;
        f.limiter.check_rate_limit(&req).await;
        assert_eq!(f.limiter.get_count(&rule, &req.key).await.unwrap(), 2);

        assert!(f.limiter.reset("public", &req.key).await.unwrap());
        assert_eq!(f.limiter.get_count(&rule, &req.key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_payment_denials_feed_fraud_and_lock() {
        let f = fixture();
        let rule = RateLimitRule::new("payment", &f.config.rate_limit.rules.payment);
        let req = request(rule, "5.5.5.5", Some("u1"), "/paypal");

        for _ in 0..3 {
            assert!(f.limiter.check_rate_limit(&req).await.allowed);
        }

        // Four denied attempts inside five minutes reach the lock threshold
        let mut last = None;
        for _ in 0..4 {
            let decision = f.limiter.check_rate_limit(&req).await;
            assert!(!decision.allowed);
            last = Some(decision);
        }
        let last = last.unwrap();
        assert!(last.fraud.unwrap().newly_locked);

        // Locked: even a different payment endpoint for the same pair is denied
        let other = request(
            RateLimitRule::new("payment_capture", &f.config.rate_limit.rules.payment),
            "5.5.5.5",
            Some("u1"),
            "/paypal/capture",
        );
        let decision = f.limiter.check_rate_limit(&other).await;
        assert_eq!(decision.reason, Some(DenyReason::FraudLockout));
        assert!(decision.retry_after_secs().unwrap() > 3_000);
    }

    #[tokio::test]
    async fn test_failsafe_denies_privileged_types() {
        let f = fixture();
        f.store.set_unavailable(true);

        let rule = RateLimitRule::new("auth", &f.config.rate_limit.rules.auth);
        let decision = f.limiter.check_rate_limit(&request(rule, "1.1.1.1", None, "/login")).await;
        assert!(!decision.allowed);
        assert!(decision.failsafe_mode);
        assert_eq!(decision.reason, Some(DenyReason::StoreUnavailable));

        let rule = RateLimitRule::new("payment", &f.config.rate_limit.rules.payment);
        let decision = f
            .limiter
            .check_rate_limit(&request(rule, "1.1.1.1", Some("u1"), "/paypal"))
            .await;
        assert!(!decision.allowed);
        assert!(decision.failsafe_mode);
    }

    #[tokio::test]
    async fn test_failsafe_allows_small_allowance_for_public() {
        let f = fixture();
        f.store.set_unavailable(true);

        let rule = RateLimitRule::new("public", &f.config.rate_limit.rules.public);
        let req = request(rule, "1.1.1.1", None, "/get-client-ip");
        for _ in 0..3 {
            let decision = f.limiter.check_rate_limit(&req).await;
            assert!(decision.allowed);
            assert!(decision.failsafe_mode);
        }
        let decision = f.limiter.check_rate_limit(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::FailsafeExhausted));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let rule = RateLimitRule {
            limit_type: "generate".to_string(),
            max_requests: 1,
            window_ms: 60_000,
        };
        let decision = RateLimitDecision::deny(&rule, DenyReason::WindowExhausted, 0, 50_001);
        assert_eq!(decision.retry_after_secs(), Some(51));
        let decision = RateLimitDecision::deny(&rule, DenyReason::WindowExhausted, 0, 0);
        assert_eq!(decision.retry_after_secs(), Some(1));
    }
}
