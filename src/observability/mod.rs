pub mod health;
pub mod metrics;
pub mod tracing;

pub use health::{ComponentStatus, HealthChecker, HealthStatus};
pub use metrics::{track_http, MetricsRecorder};
pub use tracing::init_tracing;
