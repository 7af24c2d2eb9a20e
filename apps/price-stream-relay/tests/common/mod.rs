//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use price_stream_relay::{
    ChannelListener, DeliveryError, EngineSettings, Listener, ListenerId, PriceUpdate,
    SharedListener, SourceError, StreamEngine, SymbolKey, ValueSource,
};

/// Parse a `SCOPE:SYMBOL` key.
pub fn key(raw: &str) -> SymbolKey {
    raw.parse().unwrap()
}

/// Fast timings for tests running on paused time.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        open_timeout: Duration::from_secs(30),
        settle_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        read_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_secs(1),
    }
}

// =============================================================================
// Scripted Source
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    closes: AtomicUsize,
}

/// Value source whose readings are set by the test.
///
/// Every read returns the key's current reading until the test changes it.
/// Opens can be held at a gate so a test controls exactly when they finish.
#[derive(Debug)]
pub struct ScriptedSource {
    current: Mutex<HashMap<SymbolKey, String>>,
    failing: Mutex<HashSet<SymbolKey>>,
    open: Mutex<HashSet<SymbolKey>>,
    counters: Mutex<HashMap<SymbolKey, Arc<Counters>>>,
    open_delay: Mutex<Duration>,
    shutdowns: AtomicUsize,
    overlapping_sessions: AtomicUsize,
    opens_held: watch::Sender<bool>,
}

impl ScriptedSource {
    /// Empty source: every key is unknown.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::default(),
            failing: Mutex::default(),
            open: Mutex::default(),
            counters: Mutex::default(),
            open_delay: Mutex::default(),
            shutdowns: AtomicUsize::new(0),
            overlapping_sessions: AtomicUsize::new(0),
            opens_held: watch::Sender::new(false),
        })
    }

    /// Source that knows `symbols`, each with an initial reading.
    pub fn with(symbols: &[(&str, &str)]) -> Arc<Self> {
        let source = Self::empty();
        for (k, raw) in symbols {
            source.set(k, raw);
        }
        source
    }

    /// Set the reading returned for `raw_key` from now on.
    pub fn set(&self, raw_key: &str, raw: &str) {
        self.current.lock().insert(key(raw_key), raw.to_string());
    }

    /// Make reads for `raw_key` fail until cleared.
    pub fn fail_reads(&self, raw_key: &str, failing: bool) {
        let k = key(raw_key);
        if failing {
            self.failing.lock().insert(k);
        } else {
            self.failing.lock().remove(&k);
        }
    }

    /// Delay every `open` by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Park every `open` until [`ScriptedSource::release_opens`].
    pub fn hold_opens(&self) {
        self.opens_held.send_replace(true);
    }

    /// Let parked and future opens proceed.
    pub fn release_opens(&self) {
        self.opens_held.send_replace(false);
    }

    pub fn opens(&self, raw_key: &str) -> usize {
        self.counters(&key(raw_key)).opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self, raw_key: &str) -> usize {
        self.counters(&key(raw_key)).reads.load(Ordering::SeqCst)
    }

    pub fn closes(&self, raw_key: &str) -> usize {
        self.counters(&key(raw_key)).closes.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Number of times `open` was called for a key that already had a session.
    pub fn overlapping_sessions(&self) -> usize {
        self.overlapping_sessions.load(Ordering::SeqCst)
    }

    /// Keys with a session open at the source.
    pub fn open_keys(&self) -> usize {
        self.open.lock().len()
    }

    fn counters(&self, k: &SymbolKey) -> Arc<Counters> {
        Arc::clone(self.counters.lock().entry(k.clone()).or_default())
    }
}

#[async_trait]
impl ValueSource for ScriptedSource {
    async fn open(&self, key: &SymbolKey) -> Result<String, SourceError> {
        self.counters(key).opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut held = self.opens_held.subscribe();
        let _ = held.wait_for(|held| !held).await;

        let initial = self
            .current
            .lock()
            .get(key)
            .cloned()
            .ok_or(SourceError::NotFound)?;

        if !self.open.lock().insert(key.clone()) {
            self.overlapping_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(initial)
    }

    async fn read(&self, key: &SymbolKey) -> Result<Option<String>, SourceError> {
        self.counters(key).reads.fetch_add(1, Ordering::SeqCst);

        if !self.open.lock().contains(key) {
            return Err(SourceError::NoSession(key.to_string()));
        }
        if self.failing.lock().contains(key) {
            return Err(SourceError::Failed("scripted failure".to_string()));
        }
        Ok(self.current.lock().get(key).cloned())
    }

    async fn close(&self, key: &SymbolKey) -> Result<(), SourceError> {
        self.counters(key).closes.fetch_add(1, Ordering::SeqCst);
        self.open.lock().remove(key);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SourceError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine over `source` with [`fast_settings`].
pub fn engine(source: &Arc<ScriptedSource>) -> StreamEngine {
    StreamEngine::new(Arc::clone(source) as Arc<dyn ValueSource>, fast_settings())
}

// =============================================================================
// Listeners
// =============================================================================

/// A channel listener plus its receiving end.
pub struct Probe {
    pub id: ListenerId,
    pub listener: SharedListener,
    rx: mpsc::Receiver<PriceUpdate>,
}

impl Probe {
    pub fn new() -> Self {
        let (listener, rx) = ChannelListener::new(64);
        Self {
            id: Listener::id(&listener),
            listener: Arc::new(listener),
            rx,
        }
    }

    pub fn handle(&self) -> SharedListener {
        Arc::clone(&self.listener)
    }

    /// Next delivered value, waiting up to one second.
    pub async fn next(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for an update")
            .expect("listener channel closed")
            .value
            .to_string()
    }

    /// Assert nothing is delivered for `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(update)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("unexpected update {}", update.value);
        }
    }
}

/// Channel listener whose deliveries wait until its gate is open.
pub struct GatedListener {
    inner: ChannelListener,
    gate: watch::Receiver<bool>,
}

impl GatedListener {
    /// Listener with an open gate, the gate's control, and the receiving end.
    pub fn new() -> (Arc<Self>, watch::Sender<bool>, mpsc::Receiver<PriceUpdate>) {
        let (inner, rx) = ChannelListener::new(64);
        let (gate_tx, gate) = watch::channel(true);
        (Arc::new(Self { inner, gate }), gate_tx, rx)
    }
}

#[async_trait]
impl Listener for GatedListener {
    fn id(&self) -> ListenerId {
        Listener::id(&self.inner)
    }

    async fn deliver(&self, update: &PriceUpdate) -> Result<(), DeliveryError> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.deliver(update).await
    }
}

/// Listener whose every delivery fails.
pub struct BrokenListener(pub ListenerId);

#[async_trait]
impl Listener for BrokenListener {
    fn id(&self) -> ListenerId {
        self.0
    }

    async fn deliver(&self, _update: &PriceUpdate) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("socket reset".to_string()))
    }
}
