use crate::failsafe::CircuitBreaker;
use crate::observability::MetricsRecorder;
use crate::store::{BatchWrite, DocumentStore, StoreError, StoreResult, StoredDocument, TxFn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Decorator adding a per-operation timeout and circuit breaking to any
/// backend. Conflicts and bad documents count as the store having answered.
pub struct GuardedStore {
    inner: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn DocumentStore>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            inner,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn guard<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        if !self.breaker.can_execute().await {
            return Err(StoreError::CircuitOpen);
        }

        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        match &result {
            Err(e) if e.is_unreachable() => {
                tracing::warn!(operation = operation, error = %e, "Store operation failed");
                MetricsRecorder::record_store_failure(operation);
                self.breaker.on_failure().await;
            }
            _ => self.breaker.on_success().await,
        }

        result
    }
}

#[async_trait]
impl DocumentStore for GuardedStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.guard("get", self.inner.get(collection, id)).await
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.guard("put", self.inner.put(collection, id, data, expires_at))
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        self.guard("delete", self.inner.delete(collection, id)).await
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<StoredDocument>> {
        self.guard("list", self.inner.list(collection)).await
    }

    async fn transact(&self, collection: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()> {
        self.guard("transact", self.inner.transact(collection, id, body))
            .await
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()> {
        self.guard("write_batch", self.inner.write_batch(writes)).await
    }

    async fn purge_expired(&self, collection: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        self.guard("purge_expired", self.inner.purge_expired(collection, now))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.guard("ping", self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::failsafe::CircuitState;
    use crate::store::MemoryStore;

    fn guarded(threshold: u32) -> (Arc<ManualClock>, Arc<MemoryStore>, GuardedStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let memory = Arc::new(MemoryStore::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(clock.clone(), threshold, 30_000));
        let store = GuardedStore::new(memory.clone(), breaker, Duration::from_secs(2));
        (clock, memory, store)
    }

    #[tokio::test]
    async fn test_failures_open_the_circuit() {
        let (_, memory, store) = guarded(2);
        memory.set_unavailable(true);

        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.ping().await, Err(StoreError::CircuitOpen)));
        assert_eq!(store.breaker().state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_closes_after_period_and_success() {
        let (clock, memory, store) = guarded(1);
        memory.set_unavailable(true);
        assert!(store.ping().await.is_err());

        memory.set_unavailable(false);
        assert!(matches!(store.ping().await, Err(StoreError::CircuitOpen)));

        clock.advance(chrono::Duration::seconds(30));
        assert!(store.ping().await.is_ok());
        assert_eq!(store.breaker().state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_conflict_counts_as_answer() {
        let (_, _, store) = guarded(1);
        let mut body = |_: Option<Value>| -> StoreResult<crate::store::Mutation> {
            Err(StoreError::conflict("c", "d"))
        };
        assert!(store.transact("c", "d", &mut body).await.is_err());
        assert_eq!(store.breaker().state().await, CircuitState::Closed);
    }
}
