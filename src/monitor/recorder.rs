use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::crypto::hash_key;
use crate::domain::{AlertLevel, SecurityEvent, SecurityEventType, Severity, ThreatCategory};
use crate::monitor::event_log::SecurityEventLog;
use crate::observability::MetricsRecorder;
use crate::store::{collections, get_doc, update_doc, Change, Document, DocumentStore, StoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client address used when an event carries none
const UNKNOWN_CLIENT: &str = "unknown";

/// One occurrence inside an [`EventCountEntry`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountedEvent {
    pub ts: i64,
    pub event_id: String,
    pub severity: Severity,
    pub user_id: Option<String>,
}

/// Per (event type, client address) aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCountEntry {
    pub event_type: SecurityEventType,
    pub client_ip: String,
    pub events: Vec<CountedEvent>,
    /// Lifetime total, unaffected by pruning
    pub event_count: u64,
    pub active_alert_id: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Document for EventCountEntry {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// What recording one event produced
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub short_term_count: usize,
    pub alert: Option<AlertLevel>,
    pub threat_score: Option<u32>,
    pub threat_category: Option<ThreatCategory>,
}

/// Store-backed security monitor.
///
/// Every event goes to the append-only log, then updates the count entry
/// for its (type, address) pair, then the alert store, then the threat
/// level of the user or address it concerns. Each step is its own
/// transaction on a document only the monitor writes.
pub struct SecurityMonitor {
    pub(super) store: Arc<dyn DocumentStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) secret: String,
    pub(super) config: MonitorConfig,
    pub(super) max_retries: u32,
    event_log: SecurityEventLog,
}

impl SecurityMonitor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        secret: String,
        config: MonitorConfig,
        max_retries: u32,
        event_log: SecurityEventLog,
    ) -> Self {
        Self {
            store,
            clock,
            secret,
            config,
            max_retries,
            event_log,
        }
    }

    pub fn event_log(&self) -> &SecurityEventLog {
        &self.event_log
    }

    pub(super) fn count_id(&self, event_type: SecurityEventType, client_ip: &str) -> String {
        hash_key(
            &self.secret,
            "event_count",
            &format!("{}:{}", event_type.as_str(), client_ip),
        )
    }

    /// Record an event and run threshold and threat evaluation
    pub async fn record_security_event(&self, event: SecurityEvent) -> StoreResult<RecordOutcome> {
        MetricsRecorder::record_security_event(event.event_type.as_str(), event.severity.as_str());

        if let Err(e) = self.event_log.record(event.clone()).await {
            warn!(event_id = %event.event_id, error = %e, "Security event not queued for the log");
        }

        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let long_start = now_ms - self.config.long_term_window_seconds * 1_000;
        let short_start = now_ms - self.config.short_term_window_seconds * 1_000;
        let cap = self.config.max_events_per_entry.max(2);
        let client_ip = event
            .client_ip
            .clone()
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
        let count_id = self.count_id(event.event_type, &client_ip);
        let expires_at = now + Duration::seconds(self.config.long_term_window_seconds);

        let (short_term_count, active_alert_id) = update_doc(
            self.store.as_ref(),
            collections::SECURITY_COUNTS,
            &count_id,
            self.max_retries,
            |current: Option<EventCountEntry>| {
                let mut entry = current.unwrap_or_else(|| EventCountEntry {
                    event_type: event.event_type,
                    client_ip: client_ip.clone(),
                    events: Vec::new(),
                    event_count: 0,
                    active_alert_id: None,
                    last_updated: now,
                    expires_at,
                });

                entry.events.retain(|e| e.ts > long_start);
                entry.events.push(CountedEvent {
                    ts: now_ms,
                    event_id: event.event_id.clone(),
                    severity: event.severity,
                    user_id: event.user_id.clone(),
                });
                if entry.events.len() > cap {
                    // Overflow keeps the most recent half
                    let excess = entry.events.len() - cap / 2;
                    entry.events.drain(..excess);
                }
                entry.event_count += 1;
                entry.last_updated = now;
                entry.expires_at = expires_at;

                let short = entry.events.iter().filter(|e| e.ts > short_start).count();
                let active = entry.active_alert_id.clone();
                Ok((Change::Put(entry), (short, active)))
            },
        )
        .await?;

        let alert = self
            .check_alert_thresholds(&event, &client_ip, &count_id, short_term_count, active_alert_id)
            .await?;
        let threat = self.update_threat_level(&event).await?;

        debug!(
            event_type = event.event_type.as_str(),
            severity = event.severity.as_str(),
            short_term_count = short_term_count,
            "Recorded security event"
        );

        Ok(RecordOutcome {
            short_term_count,
            alert,
            threat_score: threat.as_ref().map(|t| t.threat_score),
            threat_category: threat.map(|t| t.category),
        })
    }

    /// Occurrences of `event_type` from `client_ip` within `window`
    pub async fn event_count(
        &self,
        event_type: SecurityEventType,
        client_ip: &str,
        window: Duration,
    ) -> StoreResult<usize> {
        let since = (self.clock.now() - window).timestamp_millis();
        let entry: Option<EventCountEntry> = get_doc(
            self.store.as_ref(),
            collections::SECURITY_COUNTS,
            &self.count_id(event_type, client_ip),
        )
        .await?;
        Ok(entry.map_or(0, |e| e.events.iter().filter(|ev| ev.ts > since).count()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EventLogConfig;
    use crate::store::MemoryStore;

    pub(crate) fn monitor_with(config: MonitorConfig) -> (Arc<ManualClock>, Arc<MemoryStore>, SecurityMonitor) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let (log, _handle) = SecurityEventLog::new(store.clone(), EventLogConfig::default());
        let monitor = SecurityMonitor::new(
            store.clone(),
            clock.clone(),
            "test-secret".to_string(),
            config,
            3,
            log,
        );
        (clock, store, monitor)
    }

    pub(crate) fn event(clock: &ManualClock, kind: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(kind, severity, clock.now()).with_client_ip("1.2.3.4")
    }

    #[tokio::test]
    async fn test_recording_twice_adds_two() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());
        let window = Duration::minutes(5);

        let before = monitor
            .event_count(SecurityEventType::SuspiciousActivity, "1.2.3.4", window)
            .await
            .unwrap();
        let e = event(&clock, SecurityEventType::SuspiciousActivity, Severity::Low);
        monitor.record_security_event(e.clone()).await.unwrap();
        monitor.record_security_event(e).await.unwrap();
        let after = monitor
            .event_count(SecurityEventType::SuspiciousActivity, "1.2.3.4", window)
            .await
            .unwrap();

        assert_eq!(after - before, 2);
    }

    #[tokio::test]
    async fn test_short_window_excludes_old_events() {
        let (clock, _store, monitor) = monitor_with(MonitorConfig::default());

        for _ in 0..3 {
            let e = event(&clock, SecurityEventType::AuthFailure, Severity::Medium);
            monitor.record_security_event(e).await.unwrap();
        }
        clock.advance(Duration::minutes(10));
        let e = event(&clock, SecurityEventType::AuthFailure, Severity::Medium);
        let outcome = monitor.record_security_event(e).await.unwrap();

        assert_eq!(outcome.short_term_count, 1);
        assert_eq!(
            monitor
                .event_count(SecurityEventType::AuthFailure, "1.2.3.4", Duration::hours(1))
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_overflow_keeps_recent_half() {
        let config = MonitorConfig {
            max_events_per_entry: 10,
            ..MonitorConfig::default()
        };
        let (clock, _store, monitor) = monitor_with(config);

        for _ in 0..11 {
            let e = event(&clock, SecurityEventType::SystemError, Severity::Low);
            monitor.record_security_event(e).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        let count = monitor
            .event_count(SecurityEventType::SystemError, "1.2.3.4", Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 5);
    }
}
