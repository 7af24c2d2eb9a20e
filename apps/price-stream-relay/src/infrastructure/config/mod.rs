//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_SIM_SYMBOLS, RelayConfig, ServerSettings, SimulationSettings,
};
