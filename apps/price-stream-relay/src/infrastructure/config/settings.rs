//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Unparseable numbers fall back to their defaults; values that parse but
//! make no sense are rejected.

use std::time::Duration;

use crate::application::services::EngineSettings;
use crate::domain::key::SymbolKey;

/// Symbols served by the simulated source when none are configured.
pub const DEFAULT_SIM_SYMBOLS: &str = "BINANCE:BTCUSD,BINANCE:ETHUSD,NASDAQ:AAPL";

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Port for the health, metrics, and streaming routes.
    pub http_port: u16,
    /// Per-connection queue depth for streamed updates.
    pub listener_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8083,
            listener_buffer: 256,
        }
    }
}

/// Settings for the built-in simulated value source.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    /// Keys the source knows about. Anything else is reported as not found.
    pub symbols: Vec<SymbolKey>,
    /// Probability in `[0, 1]` that a single read fails.
    pub flakiness: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SIM_SYMBOLS
                .split(',')
                .filter_map(|raw| raw.parse().ok())
                .collect(),
            flakiness: 0.05,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Session timing.
    pub engine: EngineSettings,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Simulated source settings.
    pub simulation: SimulationSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            server: ServerSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable holds a value the
    /// relay cannot run with.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let engine = EngineSettings {
            open_timeout: env
                .duration_secs("RELAY_OPEN_TIMEOUT_SECS", defaults.engine.open_timeout),
            settle_delay: env
                .duration_millis("RELAY_SETTLE_DELAY_MS", defaults.engine.settle_delay),
            poll_interval: env
                .duration_millis("RELAY_POLL_INTERVAL_MS", defaults.engine.poll_interval),
            read_timeout: env
                .duration_millis("RELAY_READ_TIMEOUT_MS", defaults.engine.read_timeout),
            close_timeout: env
                .duration_secs("RELAY_CLOSE_TIMEOUT_SECS", defaults.engine.close_timeout),
        };

        if engine.poll_interval.is_zero() {
            return Err(ConfigError::invalid("RELAY_POLL_INTERVAL_MS", "must be positive"));
        }
        if engine.open_timeout.is_zero() {
            return Err(ConfigError::invalid("RELAY_OPEN_TIMEOUT_SECS", "must be positive"));
        }
        if engine.read_timeout.is_zero() {
            return Err(ConfigError::invalid("RELAY_READ_TIMEOUT_MS", "must be positive"));
        }

        let server = ServerSettings {
            http_port: env.parse("RELAY_HTTP_PORT", defaults.server.http_port),
            listener_buffer: env.parse("RELAY_LISTENER_BUFFER", defaults.server.listener_buffer),
        };

        if server.listener_buffer == 0 {
            return Err(ConfigError::invalid("RELAY_LISTENER_BUFFER", "must be positive"));
        }

        let symbols = match lookup("RELAY_SIM_SYMBOLS") {
            Some(raw) => parse_symbols(&raw)?,
            None => defaults.simulation.symbols,
        };

        let flakiness = env.parse("RELAY_SIM_FLAKINESS", defaults.simulation.flakiness);
        if !(0.0..=1.0).contains(&flakiness) {
            return Err(ConfigError::invalid(
                "RELAY_SIM_FLAKINESS",
                "must be between 0 and 1",
            ));
        }

        Ok(Self {
            engine,
            server,
            simulation: SimulationSettings { symbols, flakiness },
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds an unusable value.
    #[error("invalid value for {name}: {reason}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

fn parse_symbols(raw: &str) -> Result<Vec<SymbolKey>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<SymbolKey>()
                .map_err(|e| ConfigError::invalid("RELAY_SIM_SYMBOLS", format!("{entry}: {e}")))
        })
        .collect()
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
