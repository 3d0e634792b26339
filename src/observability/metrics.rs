use crate::failsafe::CircuitState;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

// Metrics registry
static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("http_requests_total registers once")
});

static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]
    )
    .expect("http_request_duration_seconds registers once")
});

static AUTH_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auth_decisions_total",
        "Request authenticator outcomes by terminal state and code",
        &["state", "code"]
    )
    .expect("auth_decisions_total registers once")
});

static AUTH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "auth_latency_seconds",
        "Request authenticator latency in seconds",
        &["state"],
        vec![0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]
    )
    .expect("auth_latency_seconds registers once")
});

static RATE_LIMIT_EXCEEDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rate_limit_exceeded_total",
        "Total number of rate limit denials",
        &["limit_type", "reason"]
    )
    .expect("rate_limit_exceeded_total registers once")
});

static SECURITY_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "security_events_total",
        "Security events recorded",
        &["event_type", "severity"]
    )
    .expect("security_events_total registers once")
});

static SECURITY_ALERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "security_alerts_total",
        "Security alerts raised",
        &["level"]
    )
    .expect("security_alerts_total registers once")
});

static EVENT_LOG_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "security_event_log_written_total",
        "Security events persisted by the event log"
    )
    .expect("security_event_log_written_total registers once")
});

static EVENT_LOG_FLUSH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "security_event_log_flush_seconds",
        "Security event log batch write latency in seconds",
        vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]
    )
    .expect("security_event_log_flush_seconds registers once")
});

static STORE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "store_failures_total",
        "Document store operations that failed or timed out",
        &["operation"]
    )
    .expect("store_failures_total registers once")
});

static CIRCUIT_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "store_circuit_state",
        "Store circuit breaker state (0 closed, 1 half-open, 2 open)"
    )
    .expect("store_circuit_state registers once")
});

static USAGE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "usage_consumed_total",
        "Descriptions consumed by plan",
        &["plan"]
    )
    .expect("usage_consumed_total registers once")
});

static EXTERNAL_CALLS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "external_calls_total",
        "Outbound calls to third-party services",
        &["service", "outcome"]
    )
    .expect("external_calls_total registers once")
});

pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn record_http_request(method: &str, path: &str, status: u16) {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
    }

    pub fn record_http_duration(method: &str, path: &str, duration: f64) {
        HTTP_REQUEST_DURATION
            .with_label_values(&[method, path])
            .observe(duration);
    }

    pub fn record_auth_decision(state: &str, code: &str, duration: f64) {
        AUTH_DECISIONS_TOTAL.with_label_values(&[state, code]).inc();
        AUTH_LATENCY.with_label_values(&[state]).observe(duration);
    }

    pub fn record_rate_limit_exceeded(limit_type: &str, reason: &str) {
        RATE_LIMIT_EXCEEDED_TOTAL
            .with_label_values(&[limit_type, reason])
            .inc();
    }

    pub fn record_security_event(event_type: &str, severity: &str) {
        SECURITY_EVENTS_TOTAL
            .with_label_values(&[event_type, severity])
            .inc();
    }

    pub fn record_alert(level: &str) {
        SECURITY_ALERTS_TOTAL.with_label_values(&[level]).inc();
    }

    pub fn record_event_batch(count: usize, duration: f64) {
        EVENT_LOG_WRITTEN_TOTAL.inc_by(count as u64);
        EVENT_LOG_FLUSH_DURATION.observe(duration);
    }

    pub fn record_store_failure(operation: &str) {
        STORE_FAILURES_TOTAL.with_label_values(&[operation]).inc();
    }

    pub fn set_circuit_state(state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        CIRCUIT_STATE.set(value);
    }

    pub fn record_usage(plan: &str) {
        USAGE_TOTAL.with_label_values(&[plan]).inc();
    }

    pub fn record_external_call(service: &str, outcome: &str) {
        EXTERNAL_CALLS_TOTAL
            .with_label_values(&[service, outcome])
            .inc();
    }

    /// Export all metrics in Prometheus format
    pub fn export() -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode_to_string(&metric_families)
    }
}

/// Middleware counting requests and their latency per matched route
pub async fn track_http(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;
    MetricsRecorder::record_http_request(&method, &path, response.status().as_u16());
    MetricsRecorder::record_http_duration(&method, &path, started.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_includes_recorded_series() {
        MetricsRecorder::record_rate_limit_exceeded("generate", "window");
        MetricsRecorder::set_circuit_state(CircuitState::Closed);

        let text = MetricsRecorder::export().unwrap();
        assert!(text.contains("rate_limit_exceeded_total"));
        assert!(text.contains("store_circuit_state"));
    }
}
