use crate::clock::from_millis;
use crate::store::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who made the request that touched a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub endpoint: String,
}

/// Sliding-window state for one hashed `(type, key)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    #[serde(rename = "type")]
    pub limit_type: String,
    /// Request timestamps in Unix ms, oldest first
    pub requests: Vec<i64>,
    pub created_at: i64,
    pub last_request: i64,
    pub metadata: RequestMetadata,
    pub expires_at: DateTime<Utc>,
}

impl Document for RateLimitEntry {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// Parameters of a single window evaluation
#[derive(Debug, Clone, Copy)]
pub struct WindowParams {
    pub max_requests: u32,
    pub window_ms: i64,
    /// Hard cap on stored timestamps
    pub max_entries: usize,
    /// Extra TTL beyond the window before the entry is purged
    pub ttl_buffer_ms: i64,
}

/// Result of a window evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub current: u32,
    pub remaining: u32,
    /// Unix ms when the oldest counted request leaves the window
    pub reset_time_ms: i64,
    /// Only set when denied
    pub retry_after_ms: Option<i64>,
}

/// Prune, decide and record one request against a window.
///
/// The returned entry must always be written back, even on denial, so the
/// stored list never holds timestamps outside the window.
pub fn evaluate(
    existing: Option<RateLimitEntry>,
    limit_type: &str,
    metadata: RequestMetadata,
    params: WindowParams,
    now_ms: i64,
) -> (RateLimitEntry, WindowOutcome) {
    let window_start = now_ms - params.window_ms;

    let mut entry = existing.unwrap_or_else(|| RateLimitEntry {
        limit_type: limit_type.to_string(),
        requests: Vec::new(),
        created_at: now_ms,
        last_request: now_ms,
        metadata: metadata.clone(),
        expires_at: from_millis(now_ms),
    });

    entry.requests.retain(|ts| *ts > window_start);
    entry.requests.sort_unstable();
    entry.expires_at = from_millis(now_ms + params.window_ms + params.ttl_buffer_ms);

    let limit = params.max_requests;
    let count = entry.requests.len();

    if count >= limit as usize {
        let oldest = entry.requests.first().copied().unwrap_or(now_ms);
        let reset_time_ms = oldest + params.window_ms;
        let outcome = WindowOutcome {
            allowed: false,
            limit,
            current: count as u32,
            remaining: 0,
            reset_time_ms,
            retry_after_ms: Some((reset_time_ms - now_ms).max(0)),
        };
        return (entry, outcome);
    }

    entry.requests.push(now_ms);
    // Never trim below the limit, or the window could not fill
    let cap = params.max_entries.max(limit as usize);
    if entry.requests.len() > cap {
        let excess = entry.requests.len() - cap;
        entry.requests.drain(..excess);
    }
    entry.last_request = now_ms;
    entry.metadata = metadata;

    let current = entry.requests.len() as u32;
    let oldest = entry.requests.first().copied().unwrap_or(now_ms);
    let outcome = WindowOutcome {
        allowed: true,
        limit,
        current,
        remaining: limit.saturating_sub(current),
        reset_time_ms: oldest + params.window_ms,
        retry_after_ms: None,
    };
    (entry, outcome)
}

/// Number of timestamps still inside the window
pub fn count_in_window(entry: &RateLimitEntry, window_ms: i64, now_ms: i64) -> u32 {
    let window_start = now_ms - window_ms;
    entry.requests.iter().filter(|ts| **ts > window_start).count() as u32
}
