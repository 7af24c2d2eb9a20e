//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the port interfaces defined in the
//! application layer, plus the process-level concerns around them.

/// Configuration loading.
pub mod config;

/// HTTP server: health, metrics, and streaming routes.
pub mod http;

/// Channel-backed listener adapter.
pub mod listener;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Value source adapters.
pub mod source;

/// OpenTelemetry tracing integration.
pub mod telemetry;
