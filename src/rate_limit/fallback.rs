use std::collections::HashMap;
use std::sync::Mutex;

/// Hard ceiling for requests admitted while the store is unreachable
pub const FALLBACK_HARD_LIMIT: u32 = 3;

/// Process-local window consulted only while the document store is failing.
///
/// It can only ever be stricter than the shared limiter: it admits at most
/// three requests per key and window, then denies.
pub struct LocalFallbackWindow {
    max_requests: u32,
    windows: Mutex<HashMap<String, Vec<i64>>>,
}

impl LocalFallbackWindow {
    pub fn new(max_requests: u32) -> Self {
        Self {
            max_requests: max_requests.min(FALLBACK_HARD_LIMIT),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request if there is room. Returns the remaining allowance on
    /// success.
    pub fn try_acquire(&self, key: &str, window_ms: i64, now_ms: i64) -> Option<u32> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Drop keys whose windows have fully drained
        windows.retain(|_, requests| requests.iter().any(|ts| *ts > now_ms - window_ms));

        let requests = windows.entry(key.to_string()).or_default();
        requests.retain(|ts| *ts > now_ms - window_ms);

        if requests.len() as u32 >= self.max_requests {
            return None;
        }
        requests.push(now_ms);
        Some(self.max_requests - requests.len() as u32)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_never_exceeds_hard_ceiling() {
        let window = LocalFallbackWindow::new(50);
        assert_eq!(window.max_requests(), 3);
    }

    #[test]
    fn test_allows_then_denies_then_recovers() {
        let window = LocalFallbackWindow::new(3);
        assert_eq!(window.try_acquire("k", 60_000, 1_000), Some(2));
        assert_eq!(window.try_acquire("k", 60_000, 1_001), Some(1));
        assert_eq!(window.try_acquire("k", 60_000, 1_002), Some(0));
        assert_eq!(window.try_acquire("k", 60_000, 1_003), None);
        assert_eq!(window.try_acquire("other", 60_000, 1_003), Some(2));
        assert_eq!(window.try_acquire("k", 60_000, 61_001), Some(1));
    }
}
