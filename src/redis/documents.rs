// Redis document store.
//
// Each document is a hash at `{prefix}:{collection}:{id}` with fields
// `data` (JSON), `version` and `expires_at` (Unix ms, 0 = never). Writes go
// through a compare-and-set script on `version`; the connection manager is
// multiplexed, so WATCH-based transactions are not an option.

use crate::clock::{from_millis, Clock};
use crate::store::{
    is_live, BatchWrite, DocumentStore, Mutation, StoreError, StoreResult, StoredDocument, TxFn,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

static CAS_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local current = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
        local expected = tonumber(ARGV[1])
        if expected >= 0 and current ~= expected then
            return 0
        end

        if ARGV[2] == 'del' then
            redis.call('DEL', KEYS[1])
            return 1
        end

        redis.call('HSET', KEYS[1], 'data', ARGV[3], 'version', current + 1, 'expires_at', ARGV[4])
        local expires_at = tonumber(ARGV[4])
        if expires_at > 0 then
            redis.call('PEXPIREAT', KEYS[1], expires_at)
        else
            redis.call('PERSIST', KEYS[1])
        end
        return 1
        "#,
    )
});

/// Unconditional write marker for the CAS script
const ANY_VERSION: i64 = -1;

struct RawDocument {
    data: Value,
    version: i64,
    expires_at: Option<DateTime<Utc>>,
}

pub struct RedisDocumentStore {
    manager: ConnectionManager,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl RedisDocumentStore {
    pub fn new(manager: ConnectionManager, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            clock,
            prefix: prefix.into(),
        }
    }

    fn key(&self, collection: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, id)
    }

    fn expiry_arg(expires_at: Option<DateTime<Utc>>) -> i64 {
        expires_at.map_or(0, |at| at.timestamp_millis().max(1))
    }

    async fn read_raw(&self, key: &str) -> StoreResult<Option<RawDocument>> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let data = fields
            .get("data")
            .ok_or_else(|| StoreError::Serialization(format!("{} has no data field", key)))?;
        let version = fields
            .get("version")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let expires_at = fields
            .get("expires_at")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .map(from_millis);

        Ok(Some(RawDocument {
            data: serde_json::from_str(data)?,
            version,
            expires_at,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: i64,
        mutation: &Mutation,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let mut invocation = CAS_SCRIPT.prepare_invoke();
        invocation.key(key).arg(expected_version);

        match mutation {
            Mutation::Delete => {
                invocation.arg("del").arg("").arg(0);
            }
            Mutation::Put { data, expires_at } => {
                invocation
                    .arg("put")
                    .arg(serde_json::to_string(data)?)
                    .arg(Self::expiry_arg(*expires_at));
            }
            Mutation::Keep => return Ok(true),
        }

        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let now = self.clock.now();
        Ok(self
            .read_raw(&self.key(collection, id))
            .await?
            .filter(|raw| is_live(raw.expires_at, now))
            .map(|raw| StoredDocument {
                id: id.to_string(),
                data: raw.data,
                expires_at: raw.expires_at,
            }))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let key = self.key(collection, id);
        self.compare_and_set(&key, ANY_VERSION, &Mutation::Put { data, expires_at })
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(self.key(collection, id)).await?;
        Ok(removed > 0)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<StoredDocument>> {
        let pattern = format!("{}:{}:*", self.prefix, collection);
        let key_prefix_len = pattern.len() - 1;

        let keys: Vec<String> = {
            let mut conn = self.manager.clone();
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let now = self.clock.now();
        let mut docs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.read_raw(&key).await? {
                if is_live(raw.expires_at, now) {
                    docs.push(StoredDocument {
                        id: key[key_prefix_len..].to_string(),
                        data: raw.data,
                        expires_at: raw.expires_at,
                    });
                }
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn transact(&self, collection: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()> {
        let key = self.key(collection, id);
        let now = self.clock.now();

        let (current, version) = match self.read_raw(&key).await? {
            Some(raw) => {
                let version = raw.version;
                (is_live(raw.expires_at, now).then_some(raw.data), version)
            }
            None => (None, 0),
        };

        let mutation = body(current)?;
        if matches!(mutation, Mutation::Delete) && version == 0 {
            return Ok(());
        }

        if !self.compare_and_set(&key, version, &mutation).await? {
            return Err(StoreError::conflict(collection, id));
        }
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for write in writes {
            match write {
                BatchWrite::Put {
                    collection,
                    id,
                    data,
                    expires_at,
                } => {
                    let key = self.key(&collection, &id);
                    let expiry = Self::expiry_arg(expires_at);
                    pipe.cmd("HSET")
                        .arg(&key)
                        .arg("data")
                        .arg(serde_json::to_string(&data)?)
                        .arg("expires_at")
                        .arg(expiry)
                        .ignore();
                    pipe.cmd("HINCRBY").arg(&key).arg("version").arg(1).ignore();
                    if expiry > 0 {
                        pipe.cmd("PEXPIREAT").arg(&key).arg(expiry).ignore();
                    } else {
                        pipe.cmd("PERSIST").arg(&key).ignore();
                    }
                }
                BatchWrite::Delete { collection, id } => {
                    pipe.cmd("DEL").arg(self.key(&collection, &id)).ignore();
                }
            }
        }

        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn purge_expired(&self, _collection: &str, _now: DateTime<Utc>) -> StoreResult<u64> {
        // Redis expires keys natively through PEXPIREAT
        Ok(0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        crate::redis::health_check(&mut conn).await
    }
}
