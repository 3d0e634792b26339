use crate::clock::{from_millis, Clock};
use crate::crypto::hash_key;
use crate::store::{collections, update_doc, Change, Document, DocumentStore, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Usage record for one bearer token, keyed by the hashed token id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReplayEntry {
    /// Hashed token id; the raw id never reaches the store
    pub token_id: String,
    pub usage_count: u32,
    pub first_used: i64,
    pub last_used: i64,
    pub expires_at: DateTime<Utc>,
}

impl Document for TokenReplayEntry {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Fresh { usage_count: u32 },
    Replayed { usage_count: u32, first_used: i64 },
}

impl ReplayVerdict {
    pub fn is_replay(&self) -> bool {
        matches!(self, ReplayVerdict::Replayed { .. })
    }
}

/// Guard admitting each token at most `max_usage` times per replay window
pub struct TokenReplayGuard {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    secret: String,
    window_ms: i64,
    max_usage: u32,
    max_retries: u32,
}

impl TokenReplayGuard {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        secret: String,
        window_seconds: i64,
        max_usage: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            secret,
            window_ms: window_seconds * 1_000,
            max_usage,
            max_retries,
        }
    }

    /// Check the token and record this use in the same transaction
    pub async fn check_and_record(&self, token_id: &str) -> StoreResult<ReplayVerdict> {
        let now_ms = self.clock.now_ms();
        let id = hash_key(&self.secret, "token", token_id);
        let window_ms = self.window_ms;
        let max_usage = self.max_usage;

        let verdict = update_doc(
            self.store.as_ref(),
            collections::USED_TOKENS,
            &id,
            self.max_retries,
            |current: Option<TokenReplayEntry>| {
                let active = current.filter(|entry| now_ms - entry.last_used < window_ms);

                match active {
                    Some(entry) if entry.usage_count >= max_usage => {
                        let verdict = ReplayVerdict::Replayed {
                            usage_count: entry.usage_count,
                            first_used: entry.first_used,
                        };
                        Ok((Change::Keep, verdict))
                    }
                    Some(mut entry) => {
                        entry.usage_count += 1;
                        entry.last_used = now_ms;
                        entry.expires_at = from_millis(now_ms + window_ms);
                        let verdict = ReplayVerdict::Fresh {
                            usage_count: entry.usage_count,
                        };
                        Ok((Change::Put(entry), verdict))
                    }
                    None => {
                        let entry = TokenReplayEntry {
                            token_id: id.clone(),
                            usage_count: 1,
                            first_used: now_ms,
                            last_used: now_ms,
                            expires_at: from_millis(now_ms + window_ms),
                        };
                        Ok((Change::Put(entry), ReplayVerdict::Fresh { usage_count: 1 }))
                    }
                }
            },
        )
        .await?;

        if verdict.is_replay() {
            tracing::warn!(token_hash = %id, "Token replay detected");
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn guard(max_usage: u32) -> (Arc<ManualClock>, TokenReplayGuard) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let guard = TokenReplayGuard::new(store, clock.clone(), "secret".to_string(), 300, max_usage, 3);
        (clock, guard)
    }

    #[tokio::test]
    async fn test_second_use_is_replay() {
        let (clock, guard) = guard(1);
        assert_eq!(
            guard.check_and_record("u1:1700000000").await.unwrap(),
            ReplayVerdict::Fresh { usage_count: 1 }
        );

        clock.advance(chrono::Duration::seconds(30));
        assert!(guard.check_and_record("u1:1700000000").await.unwrap().is_replay());

        // Other tokens are unaffected
        assert!(!guard.check_and_record("u1:1700000001").await.unwrap().is_replay());
    }

    #[tokio::test]
    async fn test_usage_allowed_again_after_window() {
        let (clock, guard) = guard(1);
        guard.check_and_record("jti-1").await.unwrap();

        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(
            guard.check_and_record("jti-1").await.unwrap(),
            ReplayVerdict::Fresh { usage_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_max_usage_above_one() {
        let (_, guard) = guard(3);
        for expected in 1..=3 {
            assert_eq!(
                guard.check_and_record("jti-2").await.unwrap(),
                ReplayVerdict::Fresh { usage_count: expected }
            );
        }
        assert!(guard.check_and_record("jti-2").await.unwrap().is_replay());
    }
}
