use crate::clock::{from_millis, Clock};
use crate::config::FraudConfig;
use crate::crypto::hash_key;
use crate::store::{
    collections, delete_doc, get_doc, update_doc, Change, Document, DocumentStore, StoreResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const MAX_RISK_SCORE: u32 = 100;
const RAPID_GAP_MS: i64 = 1_000;
const PATTERN_MIN_OCCURRENCES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PaymentAttempt,
    FailedAuth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivity {
    pub timestamp: i64,
    pub kind: ActivityKind,
    pub endpoint: String,
}

/// Accumulated fraud signals for one `(ip, user)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudEntry {
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    pub user_id: String,
    pub suspicious_activities: Vec<SuspiciousActivity>,
    pub risk_score: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Document for FraudEntry {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// Result of recording an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FraudAssessment {
    pub risk_score: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// This activity is the one that triggered the lock
    pub newly_locked: bool,
}

/// Weighted risk score over the activities in the detection window, capped
/// at 100.
pub fn compute_risk_score(activities: &[SuspiciousActivity], now_ms: i64, config: &FraudConfig) -> u32 {
    let rapid_window_start = now_ms - config.rapid_attempt_window_seconds * 1_000;

    let rapid_payments = activities
        .iter()
        .filter(|a| a.kind == ActivityKind::PaymentAttempt && a.timestamp > rapid_window_start)
        .count() as u32;
    let failed_auth = activities
        .iter()
        .filter(|a| a.kind == ActivityKind::FailedAuth)
        .count() as u32;

    let mut score = rapid_payments
        .saturating_mul(config.payment_attempt_weight)
        .saturating_add(failed_auth.saturating_mul(config.failed_auth_weight));

    let mut timestamps: Vec<i64> = activities.iter().map(|a| a.timestamp).collect();
    timestamps.sort_unstable();
    let gaps: Vec<i64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();

    if gaps.iter().filter(|gap| **gap < RAPID_GAP_MS).count() > PATTERN_MIN_OCCURRENCES {
        score = score.saturating_add(config.rapid_request_bonus);
    }

    let endpoints: HashSet<&str> = activities.iter().map(|a| a.endpoint.as_str()).collect();
    if endpoints.len() > PATTERN_MIN_OCCURRENCES {
        score = score.saturating_add(config.endpoint_diversity_bonus);
    }

    // Machine-regular spacing only means something with enough samples
    if activities.len() >= PATTERN_MIN_OCCURRENCES && !gaps.is_empty() {
        let mean = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
        let variance = gaps
            .iter()
            .map(|gap| (*gap as f64 - mean).powi(2))
            .sum::<f64>()
            / gaps.len() as f64;
        if variance.sqrt() < RAPID_GAP_MS as f64 {
            score = score.saturating_add(config.regular_interval_bonus);
        }
    }

    score.min(MAX_RISK_SCORE)
}

/// Fraud-risk accumulator with temporary lockout
pub struct FraudDetector {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    secret: String,
    config: FraudConfig,
    max_retries: u32,
}

impl FraudDetector {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        secret: String,
        config: FraudConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            secret,
            config,
            max_retries,
        }
    }

    fn doc_id(&self, client_ip: &str, user_id: &str) -> String {
        hash_key(&self.secret, "fraud", &format!("{}:{}", client_ip, user_id))
    }

    /// Append an activity, rescore and lock when the threshold is reached
    pub async fn record_activity(
        &self,
        client_ip: &str,
        user_id: &str,
        endpoint: &str,
        kind: ActivityKind,
    ) -> StoreResult<FraudAssessment> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - self.config.suspicious_pattern_window_seconds * 1_000;
        let id = self.doc_id(client_ip, user_id);
        let config = &self.config;

        let assessment = update_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_FRAUD,
            &id,
            self.max_retries,
            |current: Option<FraudEntry>| {
                let mut entry = current.unwrap_or_else(|| FraudEntry {
                    client_ip: client_ip.to_string(),
                    user_id: user_id.to_string(),
                    suspicious_activities: Vec::new(),
                    risk_score: 0,
                    locked_until: None,
                    updated_at: now,
                    expires_at: now,
                });

                entry.suspicious_activities.retain(|a| a.timestamp > window_start);
                entry.suspicious_activities.push(SuspiciousActivity {
                    timestamp: now_ms,
                    kind,
                    endpoint: endpoint.to_string(),
                });
                if entry.suspicious_activities.len() > config.max_activities {
                    let excess = entry.suspicious_activities.len() - config.max_activities;
                    entry.suspicious_activities.drain(..excess);
                }

                entry.risk_score = compute_risk_score(&entry.suspicious_activities, now_ms, config);

                let already_locked = entry.locked_until.map_or(false, |until| until > now);
                let newly_locked = !already_locked && entry.risk_score >= config.lock_threshold;
                if newly_locked {
                    entry.locked_until =
                        Some(from_millis(now_ms + config.lockout_duration_seconds * 1_000));
                }

                let window_expiry = from_millis(now_ms + config.suspicious_pattern_window_seconds * 1_000);
                entry.expires_at = entry
                    .locked_until
                    .map_or(window_expiry, |until| until.max(window_expiry));
                entry.updated_at = now;

                let assessment = FraudAssessment {
                    risk_score: entry.risk_score,
                    locked_until: entry.locked_until.filter(|until| *until > now),
                    newly_locked,
                };
                Ok((Change::Put(entry), assessment))
            },
        )
        .await?;

        if assessment.newly_locked {
            tracing::warn!(
                client_ip = %client_ip,
                user_id = %user_id,
                risk_score = assessment.risk_score,
                "Fraud lockout engaged"
            );
        } else {
            tracing::debug!(
                client_ip = %client_ip,
                risk_score = assessment.risk_score,
                "Recorded suspicious activity"
            );
        }

        Ok(assessment)
    }

    /// Lock expiry when the pair is currently locked
    pub async fn lock_status(&self, client_ip: &str, user_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let entry: Option<FraudEntry> = get_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_FRAUD,
            &self.doc_id(client_ip, user_id),
        )
        .await?;
        Ok(entry
            .and_then(|e| e.locked_until)
            .filter(|until| *until > now))
    }

    pub async fn is_locked(&self, client_ip: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self.lock_status(client_ip, user_id).await?.is_some())
    }

    pub async fn clear_lockout(&self, client_ip: &str, user_id: &str) -> StoreResult<bool> {
        let removed = delete_doc(
            self.store.as_ref(),
            collections::RATE_LIMIT_FRAUD,
            &self.doc_id(client_ip, user_id),
        )
        .await?;
        tracing::info!(client_ip = %client_ip, user_id = %user_id, "Fraud lockout cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn activity(ts: i64, kind: ActivityKind, endpoint: &str) -> SuspiciousActivity {
        SuspiciousActivity {
            timestamp: ts,
            kind,
            endpoint: endpoint.to_string(),
        }
    }

    fn detector() -> (Arc<ManualClock>, FraudDetector) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let detector = FraudDetector::new(
            store,
            clock.clone(),
            "test-secret".to_string(),
            FraudConfig::default(),
            3,
        );
        (clock, detector)
    }

    #[test]
    fn test_score_weights() {
        let config = FraudConfig::default();
        let now = 10_000_000;
        let activities = vec![
            activity(now - 100_000, ActivityKind::PaymentAttempt, "/paypal"),
            activity(now - 50_000, ActivityKind::PaymentAttempt, "/paypal"),
            activity(now - 20_000, ActivityKind::FailedAuth, "/paypal"),
        ];
        assert_eq!(compute_risk_score(&activities, now, &config), 75);
    }

    #[test]
    fn test_old_payment_attempts_do_not_count_as_rapid() {
        let config = FraudConfig::default();
        let now = 10_000_000;
        let activities = vec![activity(now - 600_000, ActivityKind::PaymentAttempt, "/paypal")];
        assert_eq!(compute_risk_score(&activities, now, &config), 0);
    }

    #[test]
    fn test_score_is_capped() {
        let config = FraudConfig::default();
        let now = 10_000_000;
        let activities: Vec<_> = (0..10)
            .map(|i| activity(now - i * 100, ActivityKind::PaymentAttempt, &format!("/paypal/{}", i)))
            .collect();
        assert_eq!(compute_risk_score(&activities, now, &config), 100);
    }

    #[test]
    fn test_pattern_bonuses_need_enough_samples() {
        let config = FraudConfig {
            payment_attempt_weight: 0,
            ..FraudConfig::default()
        };
        let now = 10_000_000;
        // Four evenly spaced attempts: too few for the regularity bonus
        let few: Vec<_> = (0..4)
            .map(|i| activity(now - i * 500, ActivityKind::PaymentAttempt, "/paypal"))
            .collect();
        assert_eq!(compute_risk_score(&few, now, &config), 0);

        // Seven rapid, regular attempts: rapid bonus plus regularity bonus
        let many: Vec<_> = (0..7)
            .map(|i| activity(now - i * 500, ActivityKind::PaymentAttempt, "/paypal"))
            .collect();
        assert_eq!(compute_risk_score(&many, now, &config), 25 + 15);
    }

    #[tokio::test]
    async fn test_lockout_after_threshold() {
        let (clock, detector) = detector();

        for _ in 0..3 {
            let a = detector
                .record_activity("5.5.5.5", "u1", "/paypal", ActivityKind::PaymentAttempt)
                .await
                .unwrap();
            assert!(a.locked_until.is_none());
            clock.advance(chrono::Duration::seconds(10));
        }

        let a = detector
            .record_activity("5.5.5.5", "u1", "/paypal", ActivityKind::PaymentAttempt)
            .await
            .unwrap();
        assert_eq!(a.risk_score, 100);
        assert!(a.newly_locked);
        assert!(detector.is_locked("5.5.5.5", "u1").await.unwrap());
        assert!(!detector.is_locked("5.5.5.5", "u2").await.unwrap());

        // A further activity keeps the existing lock rather than re-locking
        let a = detector
            .record_activity("5.5.5.5", "u1", "/paypal", ActivityKind::PaymentAttempt)
            .await
            .unwrap();
        assert!(!a.newly_locked);

        clock.advance(chrono::Duration::seconds(3_601));
        assert!(!detector.is_locked("5.5.5.5", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_lockout() {
        let (_, detector) = detector();
        for _ in 0..4 {
            detector
                .record_activity("5.5.5.5", "u1", "/paypal", ActivityKind::PaymentAttempt)
                .await
                .unwrap();
        }
        assert!(detector.is_locked("5.5.5.5", "u1").await.unwrap());
        detector.clear_lockout("5.5.5.5", "u1").await.unwrap();
        assert!(!detector.is_locked("5.5.5.5", "u1").await.unwrap());
    }
}
