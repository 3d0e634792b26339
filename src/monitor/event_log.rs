use crate::config::EventLogConfig;
use crate::domain::SecurityEvent;
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;
use crate::store::{collections, BatchWrite, DocumentStore};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

enum LogCommand {
    Record(Box<SecurityEvent>),
    Flush(oneshot::Sender<()>),
}

/// Append-only security event log with batched writes.
///
/// Events are queued on a bounded channel and written on batch size or
/// interval, whichever comes first. Dropping every handle flushes the
/// remaining batch and stops the processor.
pub struct SecurityEventLog {
    sender: mpsc::Sender<LogCommand>,
}

impl SecurityEventLog {
    /// Create the log and spawn its batch processor
    pub fn new(store: Arc<dyn DocumentStore>, config: EventLogConfig) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let handle = tokio::spawn(batch_processor(receiver, store, config));
        (Self { sender }, handle)
    }

    /// Queue an event, waiting for channel capacity
    pub async fn record(&self, event: SecurityEvent) -> Result<()> {
        self.sender
            .send(LogCommand::Record(Box::new(event)))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to queue security event: {}", e)))
    }

    /// Write everything queued so far and wait for it to land
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LogCommand::Flush(tx))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to request flush: {}", e)))?;
        rx.await
            .map_err(|e| AppError::Internal(format!("Event log flush interrupted: {}", e)))
    }
}

async fn batch_processor(
    mut receiver: mpsc::Receiver<LogCommand>,
    store: Arc<dyn DocumentStore>,
    config: EventLogConfig,
) {
    let mut batch: Vec<SecurityEvent> = Vec::with_capacity(config.batch_size);
    let mut flush_interval = interval(Duration::from_millis(config.flush_interval_ms.max(1)));

    info!(
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        "Security event log started"
    );

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(LogCommand::Record(event)) => {
                    batch.push(*event);
                    if batch.len() >= config.batch_size {
                        flush_batch(&mut batch, &store).await;
                    }
                }
                Some(LogCommand::Flush(done)) => {
                    flush_batch(&mut batch, &store).await;
                    let _ = done.send(());
                }
                None => {
                    warn!("Security event log channel closed, flushing remaining events");
                    flush_batch(&mut batch, &store).await;
                    break;
                }
            },

            _ = flush_interval.tick() => {
                flush_batch(&mut batch, &store).await;
            }
        }
    }

    info!("Security event log stopped");
}

async fn flush_batch(batch: &mut Vec<SecurityEvent>, store: &Arc<dyn DocumentStore>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let start = std::time::Instant::now();

    let mut writes = Vec::with_capacity(count);
    for event in batch.iter() {
        match serde_json::to_value(event) {
            Ok(data) => writes.push(BatchWrite::Put {
                collection: collections::SECURITY_EVENTS.to_string(),
                id: event.event_id.clone(),
                data,
                expires_at: Some(event.expires_at),
            }),
            Err(e) => error!(event_id = %event.event_id, error = %e, "Dropping unserializable event"),
        }
    }

    match store.write_batch(writes).await {
        Ok(()) => {
            let duration = start.elapsed();
            info!(count = count, duration_ms = duration.as_millis() as u64, "Flushed security events");
            MetricsRecorder::record_event_batch(count, duration.as_secs_f64());
            batch.clear();
        }
        Err(e) => {
            // Keep the batch for the next attempt, bounded so a dead store
            // cannot grow memory without limit
            error!(count = count, error = %e, "Failed to flush security events");
            let cap = 10_000;
            if batch.len() > cap {
                let excess = batch.len() - cap;
                batch.drain(..excess);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::domain::{SecurityEventType, Severity};
    use crate::store::MemoryStore;

    fn event(clock: &ManualClock) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::AuthFailure, Severity::Medium, clock.now())
            .with_client_ip("1.2.3.4")
    }

    #[tokio::test]
    async fn test_batching_by_size() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = EventLogConfig {
            batch_size: 5,
            flush_interval_ms: 60_000,
            channel_buffer_size: 100,
        };
        let (log, _handle) = SecurityEventLog::new(store.clone(), config);

        for _ in 0..3 {
            log.record(event(&clock)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.count(collections::SECURITY_EVENTS).await, 0, "Events should not be flushed yet");

        for _ in 0..2 {
            log.record(event(&clock)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.count(collections::SECURITY_EVENTS).await, 5, "All 5 events should be flushed");
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = EventLogConfig {
            batch_size: 100,
            flush_interval_ms: 60_000,
            channel_buffer_size: 100,
        };
        let (log, _handle) = SecurityEventLog::new(store.clone(), config);

        log.record(event(&clock)).await.unwrap();
        log.record(event(&clock)).await.unwrap();
        log.flush().await.unwrap();
        assert_eq!(store.count(collections::SECURITY_EVENTS).await, 2);
    }

    #[tokio::test]
    async fn test_drop_flushes_remaining_events() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = EventLogConfig {
            batch_size: 100,
            flush_interval_ms: 60_000,
            channel_buffer_size: 100,
        };
        let (log, handle) = SecurityEventLog::new(store.clone(), config);

        log.record(event(&clock)).await.unwrap();
        drop(log);
        handle.await.unwrap();
        assert_eq!(store.count(collections::SECURITY_EVENTS).await, 1);
    }
}
