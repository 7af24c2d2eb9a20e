//! Port Interfaces
//!
//! Contracts between the engine and the outside world, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ValueSource`: opens, reads, and closes per-key sessions upstream
//! - `Listener`: delivers `(key, value)` updates to one consumer

mod listener;
mod value_source;

pub use listener::{DeliveryError, Listener, SharedListener};
#[cfg(test)]
pub use value_source::MockValueSource;
pub use value_source::{SourceError, ValueSource};
