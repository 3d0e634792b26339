use crate::failsafe::{CircuitBreaker, CircuitState};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    pub store: ComponentStatus,
    pub circuit: ComponentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub status: String,
    pub message: Option<String>,
}

impl ComponentStatus {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
        }
    }

    fn unknown() -> Self {
        Self {
            status: "unknown".to_string(),
            message: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message),
        }
    }
}

pub struct HealthChecker {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    backend: String,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        backend: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            backend: backend.into(),
            probe_timeout,
        }
    }

    /// Liveness check - is the service running?
    pub async fn liveness(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                store: ComponentStatus::unknown(),
                circuit: ComponentStatus::unknown(),
            },
        }
    }

    /// Readiness check - can the service handle requests?
    pub async fn readiness(&self) -> HealthStatus {
        let circuit_status = self.check_circuit().await;
        let store_status = self.check_store().await;

        let overall_status = if store_status.status == "ok" && circuit_status.status == "ok" {
            "ok"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                store: store_status,
                circuit: circuit_status,
            },
        }
    }

    async fn check_store(&self) -> ComponentStatus {
        match tokio::time::timeout(self.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => ComponentStatus::ok(),
            Ok(Err(e)) => ComponentStatus::error(format!("{} store check failed: {}", self.backend, e)),
            Err(_) => ComponentStatus::error(format!(
                "{} store did not answer within {}ms",
                self.backend,
                self.probe_timeout.as_millis()
            )),
        }
    }

    async fn check_circuit(&self) -> ComponentStatus {
        match self.breaker.state().await {
            CircuitState::Closed => ComponentStatus::ok(),
            state => ComponentStatus::error(format!("Store circuit is {}", state.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_readiness_follows_store() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(clock.clone(), 5, 30_000));
        let checker = HealthChecker::new(store.clone(), breaker, "memory", Duration::from_millis(500));

        assert_eq!(checker.readiness().await.status, "ok");

        store.set_unavailable(true);
        let status = checker.readiness().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks.store.status, "error");
        assert_eq!(checker.liveness().await.status, "ok");
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_ready() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(clock.clone(), 1, 30_000));
        breaker.on_failure().await;
        let checker = HealthChecker::new(store, breaker, "memory", Duration::from_millis(500));

        let status = checker.readiness().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks.circuit.status, "error");
    }
}
