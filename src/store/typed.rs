use crate::store::{DocumentStore, Mutation, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// A typed document that knows its own expiry
pub trait Document: Serialize + DeserializeOwned + Send {
    fn expires_at(&self) -> Option<DateTime<Utc>>;
}

/// What a typed transaction body wants written back
#[derive(Debug)]
pub enum Change<T> {
    Keep,
    Put(T),
    Delete,
}

pub async fn get_doc<T: Document>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> StoreResult<Option<T>> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc.data)?)),
        None => Ok(None),
    }
}

pub async fn put_doc<T: Document>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    doc: &T,
) -> StoreResult<()> {
    let data = serde_json::to_value(doc)?;
    store.put(collection, id, data, doc.expires_at()).await
}

pub async fn delete_doc(store: &dyn DocumentStore, collection: &str, id: &str) -> StoreResult<bool> {
    store.delete(collection, id).await
}

/// List a collection, skipping documents that no longer match `T`
pub async fn list_docs<T: Document>(
    store: &dyn DocumentStore,
    collection: &str,
) -> StoreResult<Vec<(String, T)>> {
    let docs = store.list(collection).await?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match serde_json::from_value::<T>(doc.data) {
            Ok(value) => out.push((doc.id, value)),
            Err(e) => {
                tracing::warn!(collection = %collection, id = %doc.id, error = %e, "Skipping unreadable document");
            }
        }
    }
    Ok(out)
}

/// Typed read-modify-write with bounded retry on write conflicts.
///
/// The body runs once per attempt and always sees the freshest document, so
/// every retry recomputes from scratch. Conflicts beyond `max_retries` are
/// returned to the caller.
pub async fn update_doc<T, R, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    max_retries: u32,
    mut f: F,
) -> StoreResult<R>
where
    T: Document,
    R: Send,
    F: FnMut(Option<T>) -> StoreResult<(Change<T>, R)> + Send,
{
    let mut attempt = 0;
    loop {
        let mut output: Option<R> = None;
        let result = {
            let mut body = |current: Option<Value>| -> StoreResult<Mutation> {
                let current = current.map(serde_json::from_value::<T>).transpose()?;
                let (change, out) = f(current)?;
                output = Some(out);
                Ok(match change {
                    Change::Keep => Mutation::Keep,
                    Change::Put(doc) => Mutation::Put {
                        expires_at: doc.expires_at(),
                        data: serde_json::to_value(&doc)?,
                    },
                    Change::Delete => Mutation::Delete,
                })
            };
            store.transact(collection, id, &mut body).await
        };

        match result {
            Ok(()) => {
                return output.ok_or_else(|| {
                    StoreError::Aborted("transaction body did not run".to_string())
                })
            }
            Err(StoreError::Conflict { .. }) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(
                    collection = %collection,
                    attempt = attempt,
                    "Transaction conflict, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{BatchWrite, MemoryStore, StoredDocument, TxFn};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    impl Document for Counter {
        fn expires_at(&self) -> Option<DateTime<Utc>> {
            None
        }
    }

    /// Fails the first `conflicts` transactions with a write conflict
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl DocumentStore for ContendedStore {
        async fn get(&self, c: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
            self.inner.get(c, id).await
        }
        async fn put(
            &self,
            c: &str,
            id: &str,
            data: Value,
            exp: Option<DateTime<Utc>>,
        ) -> StoreResult<()> {
            self.inner.put(c, id, data, exp).await
        }
        async fn delete(&self, c: &str, id: &str) -> StoreResult<bool> {
            self.inner.delete(c, id).await
        }
        async fn list(&self, c: &str) -> StoreResult<Vec<StoredDocument>> {
            self.inner.list(c).await
        }
        async fn transact(&self, c: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::conflict(c, id));
            }
            self.inner.transact(c, id, body).await
        }
        async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()> {
            self.inner.write_batch(writes).await
        }
        async fn purge_expired(&self, c: &str, now: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.purge_expired(c, now).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    fn contended(conflicts: u32) -> ContendedStore {
        ContendedStore {
            inner: MemoryStore::new(Arc::new(ManualClock::starting_now())),
            conflicts: AtomicU32::new(conflicts),
        }
    }

    fn increment(current: Option<Counter>) -> StoreResult<(Change<Counter>, u32)> {
        let value = current.map_or(0, |c| c.value) + 1;
        Ok((Change::Put(Counter { value }), value))
    }

    #[tokio::test]
    async fn test_update_retries_conflicts() {
        let store = contended(2);
        let value = update_doc(&store, "c", "k", 3, increment).await.unwrap();
        assert_eq!(value, 1);

        let stored: Counter = get_doc(&store, "c", "k").await.unwrap().unwrap();
        assert_eq!(stored, Counter { value: 1 });
    }

    #[tokio::test]
    async fn test_update_gives_up_after_max_retries() {
        let store = contended(10);
        let err = update_doc(&store, "c", "k", 3, increment).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(get_doc::<Counter>(&store, "c", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_documents() {
        let store = contended(0);
        put_doc(&store, "c", "a", &Counter { value: 7 }).await.unwrap();
        store.put("c", "b", serde_json::json!("not a counter"), None).await.unwrap();

        let docs: Vec<(String, Counter)> = list_docs(&store, "c").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "a");
    }
}
