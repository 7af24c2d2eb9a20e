#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Price Stream Relay - Polled Value Fan-out
//!
//! Turns many subscriptions for `(scope, symbol)` keys into exactly one
//! polling session per key against an external value source, and pushes
//! only genuine value changes to every listener of that key.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Keys, price values, per-key listener state, session phases
//!   - `key`: Normalized `SCOPE:SYMBOL` identity
//!   - `price`: Shape-validated readings and delivered updates
//!   - `subscription`: Listener sets and the value cache of one key
//!   - `session`: Session lifecycle phases
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `ValueSource` and `Listener`
//!   - `services`: The stream engine, its poll loop, and fan-out
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `source`: Simulated value source
//!   - `listener`: Channel-backed listener
//!   - `http`: Health, metrics, and SSE streaming routes
//!   - `config`: Environment configuration
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                   ┌────────────────────── StreamEngine ──────────────────────┐
//! subscribe(k, L) ─►│ open once ─► poll every tick ─► changed? ─► fan-out      │──► L1
//!                   │ (ValueSource)   (ValueSource)    (cache)     (per key)   │──► L2
//! unsubscribe(k, L)►│ last listener gone ─► stop poll ─► close ─► purge state  │──► Ln
//!                   └──────────────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::key::{KeyError, SymbolKey};
pub use domain::price::{PriceUpdate, PriceValue};
pub use domain::session::SessionPhase;
pub use domain::subscription::ListenerId;

// Ports
pub use application::ports::{DeliveryError, Listener, SharedListener, SourceError, ValueSource};

// Engine
pub use application::services::{
    EngineError, EngineSettings, EngineStats, FanoutReport, StreamEngine,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig, ServerSettings, SimulationSettings};

// Adapters
pub use infrastructure::listener::ChannelListener;
pub use infrastructure::source::SimulatedSource;

// HTTP server
pub use infrastructure::http::{HttpServer, HttpServerError, HttpState, router};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
