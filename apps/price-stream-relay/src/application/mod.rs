//! Application Layer - Use cases and port definitions.
//!
//! The stream engine and the port interfaces it drives.

/// Port interfaces for value sources and listeners.
pub mod ports;

/// The stream engine and its fan-out.
pub mod services;
