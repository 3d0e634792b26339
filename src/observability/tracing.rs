use crate::config::ObservabilityConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins over the configured level. Formats: `json` for
/// production, `compact` for terse terminals, anything else pretty.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tower_http=info,sqlx=warn", config.log_level))
    });

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format.as_str() {
        "json" => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init(),
        "compact" => registry.with(fmt::layer().compact()).try_init(),
        _ => registry.with(fmt::layer().pretty()).try_init(),
    };

    if let Err(e) = result {
        // A subscriber is already installed (tests, embedding)
        tracing::debug!(error = %e, "Tracing already initialized");
        return;
    }

    tracing::info!(
        level = %config.log_level,
        format = %config.log_format,
        "Tracing initialized"
    );
}
