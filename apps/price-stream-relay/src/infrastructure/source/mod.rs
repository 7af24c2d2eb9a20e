//! Value Source Adapters
//!
//! Concrete [`ValueSource`](crate::application::ports::ValueSource)
//! implementations.

mod simulated;

pub use simulated::SimulatedSource;
