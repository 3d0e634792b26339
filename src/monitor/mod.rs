//! Security monitoring: event log, per-source counts, alerts and threat
//! levels, all kept in the document store.

pub mod alerts;
pub mod event_log;
pub mod recorder;
pub mod threat;

pub use alerts::{alert_level_for, Alert};
pub use event_log::SecurityEventLog;
pub use recorder::{EventCountEntry, RecordOutcome, SecurityMonitor};
pub use threat::{ScoredEvent, ThreatLevel};
