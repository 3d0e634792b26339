use crate::clock::Clock;
use crate::store::{collections, DocumentStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background task that physically removes expired documents.
///
/// Reads already hide expired documents, so the sweeper only reclaims space.
/// It runs one last pass when shutdown is signalled.
pub struct TtlSweeper {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// Purge every collection once, returning the number of removed documents
    pub async fn run_once(&self) -> u64 {
        let now = self.clock.now();
        let mut purged = 0;

        for collection in collections::ALL {
            match self.store.purge_expired(collection, now).await {
                Ok(n) => purged += n,
                Err(e) => {
                    tracing::warn!(collection = collection, error = %e, "TTL purge failed");
                }
            }
        }

        if purged > 0 {
            tracing::info!(purged = purged, "Purged expired documents");
        }
        purged
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("TTL sweeper running final pass before shutdown");
                        self.run_once().await;
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_once_purges_all_collections() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let soon = Some(clock.now() + chrono::Duration::seconds(5));

        store.put(collections::USED_TOKENS, "a", json!({}), soon).await.unwrap();
        store.put(collections::SECURITY_ALERTS, "b", json!({}), soon).await.unwrap();
        store.put(collections::SUBSCRIBED_USERS, "u", json!({}), None).await.unwrap();

        let sweeper = TtlSweeper::new(store.clone(), clock.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.run_once().await, 0);

        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(sweeper.run_once().await, 2);
        assert_eq!(store.count(collections::SUBSCRIBED_USERS).await, 1);
    }

    #[tokio::test]
    async fn test_final_pass_on_shutdown() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store
            .put(collections::USED_TOKENS, "a", json!({}), Some(clock.now()))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = TtlSweeper::new(store.clone(), clock.clone(), Duration::from_secs(3600)).spawn(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.purge_expired(collections::USED_TOKENS, clock.now()).await.unwrap(), 0);
    }
}
