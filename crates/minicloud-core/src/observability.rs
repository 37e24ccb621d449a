//! Logging initialisation and span helpers.
//!
//! Request-scoped key/value context propagates through spans: the HTTP
//! layer opens a request span carrying the request ID, and the dispatcher
//! opens a hook span carrying the notification identity, so every log line
//! under them is correlated without threading values by hand.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at startup. Safe to call multiple times; subsequent calls are
/// no-ops. `RUST_LOG` controls levels (e.g. `info,minicloud_db=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one inbound HTTP request.
#[must_use]
pub fn request_span(request_id: &str, method: &str, path: &str) -> Span {
    tracing::info_span!("request", request_id, method, path)
}

/// Creates a span for one hook invocation by the dispatcher.
#[must_use]
pub fn hook_span(entity: &str, id: &str, state: &str, notification_id: &str) -> Span {
    tracing::info_span!("hook", entity, id, state, notification_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn spans_carry_fields() {
        let span = request_span("01ARZ", "GET", "/projects");
        let _guard = span.enter();
        tracing::info!("inside request span");
    }
}
