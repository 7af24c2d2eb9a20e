//! Domain Layer - Core relay types with no I/O.
//!
//! Everything here is plain data plus the pure rules the engine applies to
//! it: key normalization, price shape validation, lifecycle phases, and
//! per-key listener/cache bookkeeping.

/// Canonical `(scope, symbol)` keys.
pub mod key;

/// Price readings and delivered updates.
pub mod price;

/// Session lifecycle phases.
pub mod session;

/// Listener sets, value cache, and change detection.
pub mod subscription;
