use crate::config::MonitorConfig;
use crate::crypto::new_id;
use crate::domain::{AlertLevel, EventFamily, SecurityEvent, SecurityEventType, Severity};
use crate::monitor::recorder::{EventCountEntry, SecurityMonitor};
use crate::observability::MetricsRecorder;
use crate::store::{collections, list_docs, put_doc, update_doc, Change, Document, StoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub event_type: SecurityEventType,
    pub alert_level: AlertLevel,
    pub event_count: usize,
    pub client_ip: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Document for Alert {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// Level an event breaches given its short-window count, if any
pub fn alert_level_for(
    event_type: SecurityEventType,
    severity: Severity,
    short_term_count: usize,
    config: &MonitorConfig,
) -> Option<AlertLevel> {
    if severity == Severity::Critical {
        return Some(AlertLevel::Critical);
    }
    match event_type.family() {
        EventFamily::FailedAuth if short_term_count >= config.failed_auth_alert_threshold => {
            Some(AlertLevel::Medium)
        }
        EventFamily::RateLimit if short_term_count >= config.rate_limit_alert_threshold => {
            Some(AlertLevel::High)
        }
        EventFamily::Suspicious if short_term_count >= config.suspicious_alert_threshold => {
            Some(AlertLevel::High)
        }
        _ => None,
    }
}

impl SecurityMonitor {
    /// Raise or refresh an alert when the short-window count breaches a
    /// threshold. An unresolved alert for the same (type, address) absorbs
    /// further breaches.
    pub(super) async fn check_alert_thresholds(
        &self,
        event: &SecurityEvent,
        client_ip: &str,
        count_id: &str,
        short_term_count: usize,
        active_alert_id: Option<String>,
    ) -> StoreResult<Option<AlertLevel>> {
        let Some(level) = alert_level_for(event.event_type, event.severity, short_term_count, &self.config)
        else {
            return Ok(None);
        };
        let now = self.clock.now();

        if let Some(alert_id) = active_alert_id {
            let refreshed = update_doc(
                self.store.as_ref(),
                collections::SECURITY_ALERTS,
                &alert_id,
                self.max_retries,
                |current: Option<Alert>| match current {
                    Some(mut alert) if !alert.resolved => {
                        alert.event_count += 1;
                        alert.last_seen = now;
                        alert.alert_level = alert.alert_level.max(level);
                        Ok((Change::Put(alert), true))
                    }
                    _ => Ok((Change::Keep, false)),
                },
            )
            .await?;
            if refreshed {
                return Ok(Some(level));
            }
        }

        let alert = Alert {
            alert_id: new_id(),
            event_type: event.event_type,
            alert_level: level,
            event_count: short_term_count,
            client_ip: client_ip.to_string(),
            user_id: event.user_id.clone(),
            timestamp: now,
            last_seen: now,
            resolved: false,
            resolved_at: None,
            expires_at: now + Duration::days(self.config.alert_ttl_days),
        };
        put_doc(self.store.as_ref(), collections::SECURITY_ALERTS, &alert.alert_id, &alert).await?;

        let alert_id = alert.alert_id.clone();
        update_doc(
            self.store.as_ref(),
            collections::SECURITY_COUNTS,
            count_id,
            self.max_retries,
            |current: Option<EventCountEntry>| match current {
                Some(mut entry) => {
                    entry.active_alert_id = Some(alert_id.clone());
                    Ok((Change::Put(entry), ()))
                }
                None => Ok((Change::Keep, ())),
            },
        )
        .await?;

        MetricsRecorder::record_alert(level.as_str());
        warn!(
            alert_id = %alert.alert_id,
            event_type = event.event_type.as_str(),
            alert_level = level.as_str(),
            client_ip = %client_ip,
            count = short_term_count,
            "Security alert raised"
        );

        Ok(Some(level))
    }

    /// Unresolved alerts, newest first
    pub async fn active_alerts(&self) -> StoreResult<Vec<Alert>> {
        let mut alerts: Vec<Alert> = list_docs(self.store.as_ref(), collections::SECURITY_ALERTS)
            .await?
            .into_iter()
            .map(|(_, alert)| alert)
            .filter(|alert: &Alert| !alert.resolved)
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(alerts)
    }

    /// Resolve alerts that have seen no breach for the idle window
    pub async fn resolve_idle_alerts(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let idle_before = now - Duration::seconds(self.config.alert_idle_resolve_seconds);
        let mut resolved = 0;

        for alert in self.active_alerts().await? {
            if alert.last_seen > idle_before {
                continue;
            }
            let changed = update_doc(
                self.store.as_ref(),
                collections::SECURITY_ALERTS,
                &alert.alert_id,
                self.max_retries,
                |current: Option<Alert>| match current {
                    Some(mut a) if !a.resolved && a.last_seen <= idle_before => {
                        a.resolved = true;
                        a.resolved_at = Some(now);
                        Ok((Change::Put(a), true))
                    }
                    _ => Ok((Change::Keep, false)),
                },
            )
            .await?;
            if changed {
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!(count = resolved, "Resolved idle security alerts");
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::recorder::tests::{event, monitor_with};

    #[test]
    fn test_threshold_levels() {
        let config = MonitorConfig::default();
        use SecurityEventType::*;

        assert_eq!(alert_level_for(AuthFailure, Severity::Medium, 4, &config), None);
        assert_eq!(
            alert_level_for(AuthFailure, Severity::Medium, 5, &config),
            Some(AlertLevel::Medium)
        );
        assert_eq!(alert_level_for(RateLimitExceeded, Severity::Medium, 9, &config), None);
        assert_eq!(
            alert_level_for(RateLimitExceeded, Severity::Medium, 10, &config),
            Some(AlertLevel::High)
        );
        assert_eq!(
            alert_level_for(CsrfViolation, Severity::High, 3, &config),
            Some(AlertLevel::High)
        );
        assert_eq!(
            alert_level_for(SystemError, Severity::Critical, 1, &config),
            Some(AlertLevel::Critical)
        );
        assert_eq!(alert_level_for(SystemError, Severity::High, 100, &config), None);
    }

    #[tokio::test]
    async fn test_failed_auth_alert_deduplicates() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        for i in 0..4 {
            let e = event(&clock, SecurityEventType::AuthFailure, Severity::Medium);
            let outcome = monitor.record_security_event(e).await.unwrap();
            assert_eq!(outcome.alert, None, "no alert expected at event {}", i + 1);
        }

        let e = event(&clock, SecurityEventType::AuthFailure, Severity::Medium);
        let outcome = monitor.record_security_event(e).await.unwrap();
        assert_eq!(outcome.alert, Some(AlertLevel::Medium));

        let e = event(&clock, SecurityEventType::AuthFailure, Severity::Medium);
        monitor.record_security_event(e).await.unwrap();

        let alerts = monitor.active_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_count, 6);
        assert_eq!(alerts[0].alert_level, AlertLevel::Medium);
    }

    #[tokio::test]
    async fn test_critical_event_alerts_immediately() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        let e = event(&clock, SecurityEventType::TokenReplayDetected, Severity::Critical);
        let outcome = monitor.record_security_event(e).await.unwrap();

        assert_eq!(outcome.alert, Some(AlertLevel::Critical));
        let alerts = monitor.active_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].expires_at, alerts[0].timestamp + Duration::days(30));
    }

    #[tokio::test]
    async fn test_idle_alerts_resolve_and_new_breach_opens_new_alert() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        let e = event(&clock, SecurityEventType::CircuitOpen, Severity::Critical);
        monitor.record_security_event(e).await.unwrap();

        assert_eq!(monitor.resolve_idle_alerts().await.unwrap(), 0);
        clock.advance(Duration::hours(2));
        assert_eq!(monitor.resolve_idle_alerts().await.unwrap(), 1);
        assert!(monitor.active_alerts().await.unwrap().is_empty());

        let e = event(&clock, SecurityEventType::CircuitOpen, Severity::Critical);
        monitor.record_security_event(e).await.unwrap();
        let alerts = monitor.active_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_count, 1);
    }
}
