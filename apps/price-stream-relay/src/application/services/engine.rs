//! Stream Engine
//!
//! The subscription and fan-out engine. It owns, per key:
//!
//! - a lifecycle lock serializing open and teardown, so at most one source
//!   session exists per key and concurrent first subscribers share one
//!   open attempt and its outcome
//! - the [`KeyState`] (listener set + value cache), present exactly while
//!   the session is open
//! - a fan-out lock ordering every delivery for the key, so the replay a
//!   joining listener receives always precedes poll-driven updates
//!
//! Keys never share a lock beyond the brief map lookup, so dozens of keys
//! poll and deliver fully in parallel.
//!
//! Opening runs on its own task that owns the lifecycle lock. A caller that
//! gives up while the source is still opening does not abandon the attempt:
//! the open finishes, its outcome is recorded, and its listener is registered.
//!
//! # Lock order
//!
//! `lifecycle` (async) → `fanout` (async) → `state` (sync, never held
//! across an await). The slot map lock is only ever taken on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use super::fanout;
use super::poller::{PollHandle, PollSettings};
use crate::application::ports::{SharedListener, SourceError, ValueSource};
use crate::domain::key::{KeyError, SymbolKey};
use crate::domain::price::{PriceUpdate, PriceValue};
use crate::domain::session::SessionPhase;
use crate::domain::subscription::{Join, KeyState, Leave, ListenerId};
use crate::infrastructure::metrics::{self, OpenOutcome};

// =============================================================================
// Settings
// =============================================================================

/// Timing knobs for sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on `ValueSource::open`.
    pub open_timeout: Duration,
    /// Delay between a successful open and the first poll tick.
    pub settle_delay: Duration,
    /// Period between poll ticks.
    pub poll_interval: Duration,
    /// Upper bound on a single `ValueSource::read`.
    pub read_timeout: Duration,
    /// Upper bound on `ValueSource::close`.
    pub close_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineSettings {
    const fn poll_settings(&self) -> PollSettings {
        PollSettings {
            settle_delay: self.settle_delay,
            poll_interval: self.poll_interval,
            read_timeout: self.read_timeout,
        }
    }
}

// =============================================================================
// Errors & Stats
// =============================================================================

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The scope or symbol could not be normalized.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// The source produced no usable value while opening the session.
    #[error("{key}: {reason}")]
    InvalidSymbol {
        /// Key that failed to open.
        key: SymbolKey,
        /// Human-readable reason.
        reason: String,
    },

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Keys with an open session.
    pub open_sessions: usize,
    /// Listener registrations across all keys.
    pub listeners: usize,
}

// =============================================================================
// Per-key Slot
// =============================================================================

/// Lifecycle of a slot, guarded by the slot's async lock.
enum Lifecycle {
    /// Nobody has opened the key through this slot yet.
    Vacant,
    /// Session open; the poll task is running.
    Open(PollHandle),
    /// Opening failed. Waiters that queued behind the attempt see the same
    /// error; the slot is already out of the map.
    Failed(EngineError),
    /// Torn down and out of the map. Callers holding it start over.
    Retired,
}

/// Everything the engine tracks for one key.
pub(super) struct KeySlot {
    pub(super) key: SymbolKey,
    lifecycle: Arc<tokio::sync::Mutex<Lifecycle>>,
    pub(super) fanout: tokio::sync::Mutex<()>,
    pub(super) state: Mutex<Option<KeyState<SharedListener>>>,
    phase: Mutex<SessionPhase>,
}

impl KeySlot {
    pub(super) fn new(key: SymbolKey) -> Self {
        Self {
            key,
            lifecycle: Arc::new(tokio::sync::Mutex::new(Lifecycle::Vacant)),
            fanout: tokio::sync::Mutex::new(()),
            state: Mutex::new(None),
            phase: Mutex::new(SessionPhase::Absent),
        }
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock();
        debug_assert!(
            phase.can_transition_to(next),
            "illegal session transition {} -> {}",
            phase.as_str(),
            next.as_str()
        );
        tracing::trace!(
            key = %self.key,
            from = phase.as_str(),
            to = next.as_str(),
            "Session phase"
        );
        *phase = next;
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }
}

type SlotMap = RwLock<HashMap<SymbolKey, Arc<KeySlot>>>;

/// Drop `slot` from the map unless a newer slot already replaced it.
fn remove_slot(slots: &SlotMap, slot: &Arc<KeySlot>) {
    let mut slots = slots.write();
    if slots
        .get(&slot.key)
        .is_some_and(|current| Arc::ptr_eq(current, slot))
    {
        slots.remove(&slot.key);
    }
}

fn collect_stats(slots: &SlotMap) -> EngineStats {
    let slots: Vec<_> = slots.read().values().cloned().collect();
    slots
        .iter()
        .fold(EngineStats::default(), |mut stats, slot| {
            if let Some(state) = slot.state.lock().as_ref() {
                stats.open_sessions += 1;
                stats.listeners += state.listeners().len();
            }
            stats
        })
}

fn publish_gauges(slots: &SlotMap) {
    let stats = collect_stats(slots);
    metrics::set_sessions_open(stats.open_sessions);
    metrics::set_listeners(stats.listeners);
}

// =============================================================================
// Engine
// =============================================================================

/// Subscription and fan-out engine over a [`ValueSource`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use price_stream_relay::{ChannelListener, EngineSettings, SimulatedSource, StreamEngine};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let source = Arc::new(SimulatedSource::with_symbols(["BINANCE:BTCUSD"])?);
/// let engine = StreamEngine::new(source, EngineSettings::default());
///
/// let (listener, mut updates) = ChannelListener::new(64);
/// engine.subscribe("binance", "btcusd", Arc::new(listener)).await?;
///
/// // The current value is replayed immediately, changes follow as polled.
/// while let Some(update) = updates.recv().await {
///     println!("{} = {}", update.key, update.value);
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamEngine {
    source: Arc<dyn ValueSource>,
    settings: EngineSettings,
    slots: Arc<SlotMap>,
    shutdown: CancellationToken,
}

impl StreamEngine {
    /// Create an engine with no sessions.
    #[must_use]
    pub fn new(source: Arc<dyn ValueSource>, settings: EngineSettings) -> Self {
        Self {
            source,
            settings,
            slots: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine timing settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Subscribe `listener` to `scope:symbol`.
    ///
    /// Opens a session if none exists, otherwise joins the existing one. If a
    /// value is cached it is delivered to the new listener before this call
    /// returns. Subscribing an already registered listener is a no-op.
    ///
    /// Dropping the returned future does not cancel an open already in
    /// progress; the listener may end up registered, so callers that give up
    /// should still [`unsubscribe`](StreamEngine::unsubscribe).
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidKey`] if the key cannot be normalized
    /// - [`EngineError::InvalidSymbol`] if the source has no live data for it
    /// - [`EngineError::ShutDown`] after [`StreamEngine::shutdown`]
    pub async fn subscribe(
        &self,
        scope: &str,
        symbol: &str,
        listener: SharedListener,
    ) -> Result<(), EngineError> {
        let key = SymbolKey::normalize(scope, symbol)?;
        self.subscribe_key(&key, listener).await
    }

    /// Subscribe `listener` to an already normalized key.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::subscribe`].
    pub async fn subscribe_key(
        &self,
        key: &SymbolKey,
        listener: SharedListener,
    ) -> Result<(), EngineError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::ShutDown);
            }

            let slot = self.slot_for(key);
            let lifecycle = Arc::clone(&slot.lifecycle).lock_owned().await;

            match &*lifecycle {
                Lifecycle::Retired => {}
                Lifecycle::Failed(err) => return Err(err.clone()),
                Lifecycle::Vacant => {
                    let attempt = OpenAttempt {
                        source: Arc::clone(&self.source),
                        settings: self.settings,
                        shutdown: self.shutdown.clone(),
                        slots: Arc::clone(&self.slots),
                        slot,
                    };
                    let task = tokio::spawn(attempt.run(lifecycle, listener));
                    return match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => Err(EngineError::ShutDown),
                    };
                }
                Lifecycle::Open(_) => {
                    drop(lifecycle);
                    let _fanout_guard = slot.fanout.lock().await;
                    if Self::join(&slot, &listener).await {
                        publish_gauges(&self.slots);
                        return Ok(());
                    }
                    // The last listener left after we looked; wait out the
                    // teardown and retry.
                }
            }
        }
    }

    /// Register `listener` and replay the cached value. Returns `false` if
    /// the key is no longer open. Caller holds the slot's fan-out lock.
    async fn join(slot: &KeySlot, listener: &SharedListener) -> bool {
        let id = listener.id();
        let joined = slot
            .state
            .lock()
            .as_mut()
            .map(|state| state.join(id, Arc::clone(listener)));

        match joined {
            None => false,
            Some(Join::Joined { replay }) => {
                tracing::debug!(key = %slot.key, listener = %id, "Listener registered");
                if let Some(value) = replay {
                    let update = PriceUpdate::now(slot.key.clone(), value);
                    fanout::deliver_one(&update, id, listener).await;
                }
                true
            }
            Some(Join::AlreadyJoined) => {
                tracing::debug!(key = %slot.key, listener = %id, "Listener already registered");
                true
            }
        }
    }

    // =========================================================================
    // Unsubscribe
    // =========================================================================

    /// Remove `listener` from `scope:symbol`.
    ///
    /// Removing the last listener tears the session down before returning.
    /// Unknown keys and listeners are ignored.
    pub async fn unsubscribe(&self, scope: &str, symbol: &str, listener: ListenerId) {
        match SymbolKey::normalize(scope, symbol) {
            Ok(key) => self.unsubscribe_key(&key, listener).await,
            Err(e) => tracing::debug!(error = %e, "Ignoring unsubscribe for invalid key"),
        }
    }

    /// Remove `listener` from an already normalized key.
    pub async fn unsubscribe_key(&self, key: &SymbolKey, listener: ListenerId) {
        let Some(slot) = self.slots.read().get(key).cloned() else {
            return;
        };

        let mut lifecycle = slot.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Open(_)) {
            return;
        }

        // Leaving and purging happen under one lock so no subscriber can join
        // a key whose last listener just left.
        let leave = {
            let mut state = slot.state.lock();
            let Some(key_state) = state.as_mut() else {
                return;
            };
            let leave = key_state.leave(&listener);
            if leave == Leave::LastListenerLeft {
                *state = None;
            }
            leave
        };

        match leave {
            Leave::NotRegistered => {}
            Leave::Remaining(remaining) => {
                tracing::debug!(key = %key, listener = %listener, remaining, "Listener removed");
            }
            Leave::LastListenerLeft => {
                tracing::debug!(key = %key, listener = %listener, "Last listener removed");
                if let Lifecycle::Open(poller) =
                    std::mem::replace(&mut *lifecycle, Lifecycle::Retired)
                {
                    self.teardown(&slot, poller).await;
                }
            }
        }

        drop(lifecycle);
        publish_gauges(&self.slots);
    }

    /// `OPEN → CLOSING → ABSENT`. Caller holds the lifecycle lock, has set it
    /// to `Retired`, and has purged the key state.
    async fn teardown(&self, slot: &Arc<KeySlot>, poller: PollHandle) {
        slot.set_phase(SessionPhase::Closing);
        poller.stop().await;

        match tokio::time::timeout(self.settings.close_timeout, self.source.close(&slot.key)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::record_teardown_failure();
                tracing::warn!(key = %slot.key, error = %e, "Source close failed");
            }
            Err(_) => {
                metrics::record_teardown_failure();
                tracing::warn!(key = %slot.key, "Source close timed out");
            }
        }

        slot.set_phase(SessionPhase::Absent);
        remove_slot(&self.slots, slot);
        tracing::info!(key = %slot.key, "Session closed");
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Last delivered value for `scope:symbol`, if a session is open.
    #[must_use]
    pub fn current_value(&self, scope: &str, symbol: &str) -> Option<PriceValue> {
        let key = SymbolKey::normalize(scope, symbol).ok()?;
        self.current_value_key(&key)
    }

    /// Last delivered value for a normalized key.
    #[must_use]
    pub fn current_value_key(&self, key: &SymbolKey) -> Option<PriceValue> {
        self.with_state(key, |state| state.current().cloned())
            .flatten()
    }

    /// Number of listeners registered for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &SymbolKey) -> usize {
        self.with_state(key, |state| state.listeners().len())
            .unwrap_or(0)
    }

    /// Whether `key` has an open session.
    #[must_use]
    pub fn has_session(&self, key: &SymbolKey) -> bool {
        self.with_state(key, |_| ()).is_some()
    }

    /// Lifecycle phase of `key`.
    #[must_use]
    pub fn phase(&self, key: &SymbolKey) -> SessionPhase {
        self.slots
            .read()
            .get(key)
            .map_or(SessionPhase::Absent, |slot| slot.phase())
    }

    /// Keys with an open session.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SymbolKey> {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        let mut keys: Vec<_> = slots
            .iter()
            .filter(|slot| slot.state.lock().is_some())
            .map(|slot| slot.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        collect_stats(&self.slots)
    }

    /// Whether [`StreamEngine::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every poll task, close every open session, then release the
    /// source. New subscriptions are rejected afterwards. Calling it again
    /// is a no-op.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let slots: Vec<Arc<KeySlot>> = self.slots.write().drain().map(|(_, slot)| slot).collect();
        tracing::info!(keys = slots.len(), "Shutting down stream engine");

        join_all(slots.iter().map(|slot| async move {
            let mut lifecycle = slot.lifecycle.lock().await;
            if let Lifecycle::Open(poller) = std::mem::replace(&mut *lifecycle, Lifecycle::Retired)
            {
                slot.state.lock().take();
                self.teardown(slot, poller).await;
            }
        }))
        .await;

        if let Err(e) = self.source.shutdown().await {
            tracing::warn!(error = %e, "Source shutdown failed");
        }

        publish_gauges(&self.slots);
        tracing::info!("Stream engine stopped");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn slot_for(&self, key: &SymbolKey) -> Arc<KeySlot> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }

        Arc::clone(
            self.slots
                .write()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeySlot::new(key.clone()))),
        )
    }

    fn with_state<T>(
        &self,
        key: &SymbolKey,
        f: impl FnOnce(&KeyState<SharedListener>) -> T,
    ) -> Option<T> {
        let slot = self.slots.read().get(key).cloned()?;
        let state = slot.state.lock();
        state.as_ref().map(f)
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        // Poll tasks hold child tokens; stop them even without a shutdown call.
        self.shutdown.cancel();
    }
}

// =============================================================================
// Open Attempt
// =============================================================================

/// One `ABSENT → OPENING → OPEN | ABSENT` run for a vacant slot, executed on
/// its own task while holding the slot's lifecycle lock.
struct OpenAttempt {
    source: Arc<dyn ValueSource>,
    settings: EngineSettings,
    shutdown: CancellationToken,
    slots: Arc<SlotMap>,
    slot: Arc<KeySlot>,
}

impl OpenAttempt {
    async fn run(
        self,
        mut lifecycle: OwnedMutexGuard<Lifecycle>,
        listener: SharedListener,
    ) -> Result<(), EngineError> {
        let slot = &self.slot;
        let value = match self.open().await {
            Ok(value) => value,
            Err(err) => {
                *lifecycle = Lifecycle::Failed(err.clone());
                remove_slot(&self.slots, slot);
                return Err(err);
            }
        };

        // The opener is registered before the lifecycle lock is released, so
        // an unsubscribe queued behind the open always finds it.
        let id = listener.id();
        let mut state = KeyState::with_initial(value);
        let replay = match state.join(id, Arc::clone(&listener)) {
            Join::Joined { replay } => replay,
            Join::AlreadyJoined => None,
        };

        // Hold the fan-out lock from before the poller exists until the
        // opener's replay is delivered.
        let fanout_guard = slot.fanout.lock().await;
        *slot.state.lock() = Some(state);
        *lifecycle = Lifecycle::Open(PollHandle::spawn(
            Arc::clone(slot),
            Arc::clone(&self.source),
            self.settings.poll_settings(),
            self.shutdown.child_token(),
        ));
        slot.set_phase(SessionPhase::Open);
        drop(lifecycle);
        tracing::info!(key = %slot.key, "Session opened");

        if let Some(value) = replay {
            let update = PriceUpdate::now(slot.key.clone(), value);
            fanout::deliver_one(&update, id, &listener).await;
        }
        drop(fanout_guard);

        publish_gauges(&self.slots);
        Ok(())
    }

    async fn open(&self) -> Result<PriceValue, EngineError> {
        let key = &self.slot.key;
        self.slot.set_phase(SessionPhase::Opening);
        tracing::debug!(key = %key, "Opening session");

        let started = Instant::now();
        let opened = tokio::time::timeout(self.settings.open_timeout, self.source.open(key)).await;
        metrics::record_open_duration(started.elapsed());

        let (outcome, reason) = match opened {
            Ok(Ok(raw)) => match PriceValue::parse(&raw) {
                Some(_) if self.shutdown.is_cancelled() => {
                    self.release_quietly().await;
                    self.slot.set_phase(SessionPhase::Absent);
                    return Err(EngineError::ShutDown);
                }
                Some(value) => {
                    metrics::record_session_open(OpenOutcome::Ok);
                    return Ok(value);
                }
                None => {
                    self.release_quietly().await;
                    (
                        OpenOutcome::Invalid,
                        format!("initial value {raw:?} is not a price"),
                    )
                }
            },
            Ok(Err(e @ SourceError::NotFound)) => (OpenOutcome::Invalid, e.to_string()),
            Ok(Err(e)) => (OpenOutcome::Error, e.to_string()),
            Err(_) => {
                self.release_quietly().await;
                (
                    OpenOutcome::Timeout,
                    format!(
                        "no live data within {}s",
                        self.settings.open_timeout.as_secs_f64()
                    ),
                )
            }
        };

        metrics::record_session_open(outcome);
        tracing::warn!(key = %key, reason = %reason, "Session rejected");
        self.slot.set_phase(SessionPhase::Absent);
        Err(EngineError::InvalidSymbol {
            key: key.clone(),
            reason,
        })
    }

    /// Best-effort close for a session that never reached `OPEN`.
    async fn release_quietly(&self) {
        let key = &self.slot.key;
        match tokio::time::timeout(self.settings.close_timeout, self.source.close(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(key = %key, error = %e, "Release after failed open"),
            Err(_) => tracing::debug!(key = %key, "Release after failed open timed out"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
