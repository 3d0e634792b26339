use crate::crypto::hash_key;
use crate::domain::{SecurityEvent, SecurityEventType, ThreatCategory};
use crate::monitor::recorder::SecurityMonitor;
use crate::store::{collections, get_doc, update_doc, Change, Document, StoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEvent {
    pub ts: i64,
    pub event_type: SecurityEventType,
    pub score: u32,
}

/// Rolling threat score for a user or client address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatLevel {
    pub identifier: String,
    pub threat_score: u32,
    pub category: ThreatCategory,
    pub recent_events: Vec<ScoredEvent>,
    pub last_updated: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Document for ThreatLevel {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

impl ThreatLevel {
    fn rescore(&mut self) {
        self.threat_score = self
            .recent_events
            .iter()
            .fold(0u32, |acc, e| acc.saturating_add(e.score));
        self.category = ThreatCategory::from_score(self.threat_score);
    }
}

impl SecurityMonitor {
    fn threat_id(&self, identifier: &str) -> String {
        hash_key(&self.secret, "threat", identifier)
    }

    /// Fold the event into its identifier's rolling score
    pub(super) async fn update_threat_level(&self, event: &SecurityEvent) -> StoreResult<Option<ThreatLevel>> {
        let Some(identifier) = event.threat_identifier() else {
            return Ok(None);
        };
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - self.config.threat_window_seconds * 1_000;
        let cap = self.config.max_events_per_entry.max(1);
        let expires_at = now + Duration::seconds(self.config.threat_window_seconds);

        let level = update_doc(
            self.store.as_ref(),
            collections::SECURITY_THREATS,
            &self.threat_id(&identifier),
            self.max_retries,
            |current: Option<ThreatLevel>| {
                let mut level = current.unwrap_or_else(|| ThreatLevel {
                    identifier: identifier.clone(),
                    threat_score: 0,
                    category: ThreatCategory::Low,
                    recent_events: Vec::new(),
                    last_updated: now,
                    expires_at,
                });
                level.recent_events.retain(|e| e.ts > window_start);
                level.recent_events.push(ScoredEvent {
                    ts: now_ms,
                    event_type: event.event_type,
                    score: event.score(),
                });
                if level.recent_events.len() > cap {
                    let excess = level.recent_events.len() - cap;
                    level.recent_events.drain(..excess);
                }
                level.rescore();
                level.last_updated = now;
                level.expires_at = expires_at;
                Ok((Change::Put(level.clone()), level))
            },
        )
        .await?;

        if level.category >= ThreatCategory::High {
            tracing::warn!(
                identifier = %level.identifier,
                threat_score = level.threat_score,
                category = ?level.category,
                "Elevated threat level"
            );
        }
        Ok(Some(level))
    }

    /// Current threat level, rescored against the window at read time
    pub async fn get_threat_level(&self, identifier: &str) -> StoreResult<Option<ThreatLevel>> {
        let window_start = self.clock.now_ms() - self.config.threat_window_seconds * 1_000;
        let level: Option<ThreatLevel> = get_doc(
            self.store.as_ref(),
            collections::SECURITY_THREATS,
            &self.threat_id(identifier),
        )
        .await?;
        Ok(level.map(|mut level| {
            level.recent_events.retain(|e| e.ts > window_start);
            level.rescore();
            level
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::domain::Severity;
    use crate::monitor::recorder::tests::{event, monitor_with};

    #[tokio::test]
    async fn test_scores_accumulate_per_identifier() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        let outcome = monitor
            .record_security_event(event(&clock, SecurityEventType::AuthFailure, Severity::Medium))
            .await
            .unwrap();
        assert_eq!(outcome.threat_score, Some(15));
        assert_eq!(outcome.threat_category, Some(ThreatCategory::Low));

        monitor
            .record_security_event(event(&clock, SecurityEventType::TokenReplayDetected, Severity::Critical))
            .await
            .unwrap();
        let outcome = monitor
            .record_security_event(event(&clock, SecurityEventType::PaymentFraudDetected, Severity::Critical))
            .await
            .unwrap();
        assert_eq!(outcome.threat_score, Some(85));
        assert_eq!(outcome.threat_category, Some(ThreatCategory::High));

        let level = monitor.get_threat_level("ip:1.2.3.4").await.unwrap().unwrap();
        assert_eq!(level.threat_score, 85);
        assert_eq!(level.recent_events.len(), 3);
    }

    #[tokio::test]
    async fn test_user_identifier_takes_precedence() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        let e = event(&clock, SecurityEventType::UserIdMismatch, Severity::Critical)
            .with_user(Some("u1".to_string()));
        monitor.record_security_event(e).await.unwrap();

        let level = monitor.get_threat_level("user:u1").await.unwrap().unwrap();
        assert_eq!(level.threat_score, 50);
        assert!(monitor.get_threat_level("ip:1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_old_events_leave_the_score() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        monitor
            .record_security_event(event(&clock, SecurityEventType::AuthFailure, Severity::Medium))
            .await
            .unwrap();
        clock.advance(Duration::hours(23));
        let outcome = monitor
            .record_security_event(event(&clock, SecurityEventType::RateLimitExceeded, Severity::Medium))
            .await
            .unwrap();
        assert_eq!(outcome.threat_score, Some(25));

        clock.advance(Duration::hours(2));
        let level = monitor.get_threat_level("ip:1.2.3.4").await.unwrap().unwrap();
        assert_eq!(level.threat_score, 10);
        assert_eq!(level.category, ThreatCategory::Low);
    }
}
