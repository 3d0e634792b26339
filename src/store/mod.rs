// Document store adapter shared by every stateful component

pub mod guarded;
pub mod memory;
pub mod sweeper;
pub mod typed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use guarded::GuardedStore;
pub use memory::MemoryStore;
pub use sweeper::TtlSweeper;
pub use typed::{delete_doc, get_doc, list_docs, put_doc, update_doc, Change, Document};

/// Collection names. The trial/subscriber split uses two distinct
/// collections that differ only by case.
pub mod collections {
    pub const TRIAL_USERS: &str = "Users";
    pub const SUBSCRIBED_USERS: &str = "users";
    pub const DELETED_USERS: &str = "deleted_users";
    pub const RATE_LIMIT_REQUESTS: &str = "rate_limiting_requests";
    pub const RATE_LIMIT_FRAUD: &str = "rate_limiting_fraud";
    pub const USED_TOKENS: &str = "usedTokens";
    pub const SECURITY_EVENTS: &str = "security_monitoring_events";
    pub const SECURITY_COUNTS: &str = "security_monitoring_counts";
    pub const SECURITY_THREATS: &str = "security_monitoring_threats";
    pub const SECURITY_ALERTS: &str = "security_monitoring_alerts";

    /// Collections purged by the TTL sweeper
    pub const ALL: [&str; 10] = [
        TRIAL_USERS,
        SUBSCRIBED_USERS,
        DELETED_USERS,
        RATE_LIMIT_REQUESTS,
        RATE_LIMIT_FRAUD,
        USED_TOKENS,
        SECURITY_EVENTS,
        SECURITY_COUNTS,
        SECURITY_THREATS,
        SECURITY_ALERTS,
    ];
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store circuit breaker is open")]
    CircuitOpen,

    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },

    #[error("document serialization failed: {0}")]
    Serialization(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl StoreError {
    /// True when the store could not be reached at all, as opposed to the
    /// store answering with a conflict or bad data.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Unavailable(_) | StoreError::CircuitOpen
        )
    }

    pub fn conflict(collection: &str, id: &str) -> Self {
        StoreError::Conflict {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Raw document as held by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a transaction body
#[derive(Debug, Clone)]
pub enum Mutation {
    Keep,
    Put {
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    },
    Delete,
}

/// One write in a non-transactional batch
#[derive(Debug, Clone)]
pub enum BatchWrite {
    Put {
        collection: String,
        id: String,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Transaction body: receives the current document (None when absent or
/// expired) and decides what to write.
pub type TxFn<'a> = dyn FnMut(Option<Value>) -> StoreResult<Mutation> + Send + 'a;

/// Collections of JSON documents with TTL and optimistic transactions.
///
/// Expired documents are invisible to every read even before the sweeper
/// physically removes them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>>;

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Returns whether a live document was removed
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool>;

    async fn list(&self, collection: &str) -> StoreResult<Vec<StoredDocument>>;

    /// One optimistic read-modify-write attempt. Returns
    /// `StoreError::Conflict` when another writer changed the document
    /// between the read and the write; callers decide whether to retry.
    async fn transact(&self, collection: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()>;

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()>;

    /// Physically remove documents whose expiry is at or before `now`
    async fn purge_expired(&self, collection: &str, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

pub(crate) fn is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| at > now)
}
