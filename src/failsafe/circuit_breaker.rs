use crate::clock::Clock;
use crate::observability::MetricsRecorder;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Mutable breaker state, updated under a single lock so transitions are atomic
#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at_ms: Option<i64>,
    state: CircuitState,
}

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: consecutive store failures reach the threshold
/// - `Open` -> `HalfOpen`: the open period elapses
/// - `HalfOpen` -> `Closed`: first successful store operation
/// - `HalfOpen` -> `Open`: any failure while probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Breaker guarding the document store.
///
/// This is process-local operational state: it only decides whether this
/// instance bothers the store, never whether a request is authorized.
pub struct CircuitBreaker {
    inner: RwLock<BreakerState>,
    clock: Arc<dyn Clock>,
    threshold: u32,
    open_ms: i64,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>, threshold: u32, open_ms: i64) -> Self {
        Self {
            inner: RwLock::new(BreakerState {
                consecutive_failures: 0,
                opened_at_ms: None,
                state: CircuitState::Closed,
            }),
            clock,
            threshold,
            open_ms,
        }
    }

    /// Whether an operation may be attempted. An open breaker whose period
    /// has elapsed moves to half-open and lets the probe through.
    pub async fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    if !self.open_period_elapsed(&inner) {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.open_period_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    MetricsRecorder::set_circuit_state(CircuitState::HalfOpen);
                    tracing::warn!("Store circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn open_period_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at_ms
            .map_or(true, |opened| self.clock.now_ms() - opened >= self.open_ms)
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at_ms = None;
                MetricsRecorder::set_circuit_state(CircuitState::Closed);
                tracing::info!("Store circuit breaker closed after successful operation");
            }
        }
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed && inner.consecutive_failures >= self.threshold);

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at_ms = Some(self.clock.now_ms());
            MetricsRecorder::set_circuit_state(CircuitState::Open);
            tracing::error!(
                threshold = self.threshold,
                open_ms = self.open_ms,
                "Store circuit breaker opened"
            );
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Open and still inside the open period
    pub async fn is_open(&self) -> bool {
        let inner = self.inner.read().await;
        inner.state == CircuitState::Open && !self.open_period_elapsed(&inner)
    }
}
