use crate::clock::Clock;
use crate::store::{
    is_live, BatchWrite, DocumentStore, Mutation, StoreError, StoreResult, StoredDocument, TxFn,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    data: Value,
    expires_at: Option<DateTime<Utc>>,
}

type Collection = BTreeMap<String, Entry>;

/// Single-process document store used for tests and local development.
///
/// Transactions hold the collection lock for the whole read-modify-write, so
/// they never conflict. `set_unavailable` simulates an unreachable store.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    collections: Mutex<HashMap<String, Collection>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            collections: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail as if the network were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of live documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        let now = self.clock.now();
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .map(|c| c.values().filter(|e| is_live(e.expires_at, now)).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.check_available()?;
        let now = self.clock.now();
        let collections = self.collections.lock().await;

        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .filter(|e| is_live(e.expires_at, now))
            .map(|e| StoredDocument {
                id: id.to_string(),
                data: e.data.clone(),
                expires_at: e.expires_at,
            }))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), Entry { data, expires_at });
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut collections = self.collections.lock().await;

        let removed = collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .map_or(false, |e| is_live(e.expires_at, now));
        Ok(removed)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<StoredDocument>> {
        self.check_available()?;
        let now = self.clock.now();
        let collections = self.collections.lock().await;

        Ok(collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, e)| is_live(e.expires_at, now))
                    .map(|(id, e)| StoredDocument {
                        id: id.clone(),
                        data: e.data.clone(),
                        expires_at: e.expires_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transact(&self, collection: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()> {
        self.check_available()?;
        let now = self.clock.now();
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();

        let current = docs
            .get(id)
            .filter(|e| is_live(e.expires_at, now))
            .map(|e| e.data.clone());

        match body(current)? {
            Mutation::Keep => {}
            Mutation::Put { data, expires_at } => {
                docs.insert(id.to_string(), Entry { data, expires_at });
            }
            Mutation::Delete => {
                docs.remove(id);
            }
        }
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()> {
        self.check_available()?;
        let mut collections = self.collections.lock().await;

        for write in writes {
            match write {
                BatchWrite::Put {
                    collection,
                    id,
                    data,
                    expires_at,
                } => {
                    collections
                        .entry(collection)
                        .or_default()
                        .insert(id, Entry { data, expires_at });
                }
                BatchWrite::Delete { collection, id } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, collection: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check_available()?;
        let mut collections = self.collections.lock().await;

        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, e| is_live(e.expires_at, now));
        Ok((before - docs.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
