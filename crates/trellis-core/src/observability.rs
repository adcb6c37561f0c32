//! Observability infrastructure for trellis.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across all trellis
//! components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

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
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `trellis_flow=debug`)
///
/// # Example
///
/// ```rust
/// use trellis_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for one flow lifecycle operation with standard fields.
///
/// # Example
///
/// ```rust
/// use trellis_core::observability::operation_span;
///
/// let span = operation_span("create", "customer-42");
/// let _guard = span.enter();
/// // ... drive the operation
/// ```
#[must_use]
pub fn operation_span(kind: &str, flow_id: &str) -> Span {
    tracing::info_span!("flow_operation", kind = kind, flow_id = flow_id)
}
