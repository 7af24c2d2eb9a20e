//! Simulated Value Source
//!
//! In-process [`ValueSource`] that serves a random walk per configured key.
//! Readings repeat about half the time so deduplication is exercised, and
//! each read fails with the configured probability. Unknown keys are
//! reported as [`SourceError::NotFound`].

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;

use crate::application::ports::{SourceError, ValueSource};
use crate::domain::key::{KeyError, SymbolKey};
use crate::infrastructure::config::SimulationSettings;

/// Largest single step of the walk, in basis points.
const MAX_STEP_BPS: i64 = 25;

/// Probability that a tick repeats the previous reading.
const REPEAT_PROBABILITY: f64 = 0.5;

/// Simulated source backed by a per-key random walk.
#[derive(Debug)]
pub struct SimulatedSource {
    /// Starting price in cents for each known key.
    known: HashMap<SymbolKey, i64>,
    /// Current price in cents for each open session.
    sessions: Mutex<HashMap<SymbolKey, i64>>,
    flakiness: f64,
}

impl SimulatedSource {
    /// Create a source from settings.
    #[must_use]
    pub fn new(settings: &SimulationSettings) -> Self {
        Self {
            known: settings
                .symbols
                .iter()
                .map(|key| (key.clone(), starting_cents(key)))
                .collect(),
            sessions: Mutex::new(HashMap::new()),
            flakiness: settings.flakiness.clamp(0.0, 1.0),
        }
    }

    /// Create a source that never fails reads and knows `symbols`, given in
    /// `SCOPE:SYMBOL` form.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if any entry is not a valid key.
    pub fn with_symbols<'a>(symbols: impl IntoIterator<Item = &'a str>) -> Result<Self, KeyError> {
        let symbols = symbols
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<SymbolKey>, _>>()?;

        Ok(Self::new(&SimulationSettings {
            symbols,
            flakiness: 0.0,
        }))
    }

    /// Keys this source can open, sorted.
    #[must_use]
    pub fn known_keys(&self) -> Vec<SymbolKey> {
        let mut keys: Vec<_> = self.known.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn step(&self, key: &SymbolKey) -> Result<String, SourceError> {
        let mut rng = rand::rng();
        if rng.random_bool(self.flakiness) {
            return Err(SourceError::Failed("simulated read failure".to_string()));
        }

        let mut sessions = self.sessions.lock();
        let cents = sessions
            .get_mut(key)
            .ok_or_else(|| SourceError::NoSession(key.to_string()))?;

        if !rng.random_bool(REPEAT_PROBABILITY) {
            let bps = rng.random_range(-MAX_STEP_BPS..=MAX_STEP_BPS);
            *cents = (*cents + *cents * bps / 10_000).max(1);
        }

        Ok(format_cents(*cents))
    }
}

#[async_trait]
impl ValueSource for SimulatedSource {
    async fn open(&self, key: &SymbolKey) -> Result<String, SourceError> {
        let start = *self.known.get(key).ok_or(SourceError::NotFound)?;
        let cents = *self.sessions.lock().entry(key.clone()).or_insert(start);
        tracing::debug!(key = %key, "Simulated session opened");
        Ok(format_cents(cents))
    }

    async fn read(&self, key: &SymbolKey) -> Result<Option<String>, SourceError> {
        self.step(key).map(Some)
    }

    async fn close(&self, key: &SymbolKey) -> Result<(), SourceError> {
        self.sessions
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| SourceError::NoSession(key.to_string()))
    }

    async fn shutdown(&self) -> Result<(), SourceError> {
        self.sessions.lock().clear();
        Ok(())
    }
}

/// Deterministic starting price between 1.00 and 50,000.00 derived from the key.
fn starting_cents(key: &SymbolKey) -> i64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let spread = hasher.finish() % 4_999_900;
    i64::try_from(spread).map_or(100, |cents| cents + 100)
}

fn format_cents(cents: i64) -> String {
    Decimal::new(cents, 2).to_string()
}
