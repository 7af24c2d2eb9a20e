//! Poll Loop
//!
//! One task per open key. After a settle delay it reads the source on a
//! fixed period, compares each reading against the key's cache, and fans
//! changes out. A failed or empty tick is skipped; the loop only ends when
//! its token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::KeySlot;
use super::fanout::{self, FanoutReport};
use crate::application::ports::ValueSource;
use crate::domain::price::{PriceUpdate, PriceValue};
use crate::domain::subscription::Observation;
use crate::infrastructure::metrics::{self, PollOutcomeLabel};

/// Timing of one poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PollSettings {
    pub(super) settle_delay: Duration,
    pub(super) poll_interval: Duration,
    pub(super) read_timeout: Duration,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PollOutcome {
    /// The reading differed from the cache and was fanned out.
    Changed(FanoutReport),
    /// The reading equalled the cache.
    Unchanged,
    /// The source had nothing usable, or the key is no longer open.
    Empty,
    /// The read failed or timed out.
    Failed,
}

impl PollOutcome {
    const fn label(self) -> PollOutcomeLabel {
        match self {
            Self::Changed(_) => PollOutcomeLabel::Changed,
            Self::Unchanged => PollOutcomeLabel::Unchanged,
            Self::Empty => PollOutcomeLabel::Empty,
            Self::Failed => PollOutcomeLabel::Failed,
        }
    }
}

/// Handle to a running poll task.
pub(super) struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Start polling `slot`.
    pub(super) fn spawn(
        slot: Arc<KeySlot>,
        source: Arc<dyn ValueSource>,
        settings: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(run(slot, source, settings, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel the task and wait until it has exited. No tick runs after this
    /// returns.
    pub(super) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Poll task ended abnormally");
        }
    }
}

async fn run(
    slot: Arc<KeySlot>,
    source: Arc<dyn ValueSource>,
    settings: PollSettings,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(settings.settle_delay) => {}
    }

    let mut interval = tokio::time::interval(settings.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(key = %slot.key, "Poll loop started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = poll_once(&slot, source.as_ref(), settings.read_timeout) => {
                metrics::record_poll(outcome.label());
            }
        }
    }

    tracing::debug!(key = %slot.key, "Poll loop stopped");
}

/// Read once, update the cache, and fan out on change.
pub(super) async fn poll_once(
    slot: &KeySlot,
    source: &dyn ValueSource,
    read_timeout: Duration,
) -> PollOutcome {
    let raw = match tokio::time::timeout(read_timeout, source.read(&slot.key)).await {
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) => return PollOutcome::Empty,
        Ok(Err(e)) => {
            tracing::debug!(key = %slot.key, error = %e, "Read failed");
            return PollOutcome::Failed;
        }
        Err(_) => {
            tracing::debug!(key = %slot.key, "Read timed out");
            return PollOutcome::Failed;
        }
    };

    let Some(value) = PriceValue::parse(&raw) else {
        tracing::debug!(key = %slot.key, raw = %raw, "Ignoring unparseable reading");
        return PollOutcome::Empty;
    };

    let _ordering = slot.fanout.lock().await;
    let observation = {
        let mut state = slot.state.lock();
        match state.as_mut() {
            Some(state) => state.observe(value),
            None => return PollOutcome::Empty,
        }
    };

    match observation {
        Observation::Unchanged => PollOutcome::Unchanged,
        Observation::Changed { value, listeners } => {
            tracing::trace!(
                key = %slot.key,
                value = %value,
                listeners = listeners.len(),
                "Value changed"
            );
            let update = PriceUpdate::now(slot.key.clone(), value);
            PollOutcome::Changed(fanout::notify(&update, &listeners).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::{Listener, MockValueSource, SharedListener, SourceError};
    use crate::domain::key::SymbolKey;
    use crate::domain::subscription::KeyState;
    use crate::infrastructure::listener::ChannelListener;

    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    fn open_slot(initial: &str) -> (KeySlot, mpsc::Receiver<PriceUpdate>) {
        let slot = KeySlot::new(SymbolKey::normalize("binance", "btcusd").unwrap());
        let (listener, rx) = ChannelListener::new(8);
        let mut state = KeyState::with_initial(PriceValue::parse(initial).unwrap());
        state.join(listener.id(), Arc::new(listener) as SharedListener);
        *slot.state.lock() = Some(state);
        (slot, rx)
    }

    fn scripted(readings: Vec<Result<Option<&'static str>, SourceError>>) -> MockValueSource {
        let mut readings = readings.into_iter();
        let mut source = MockValueSource::new();
        source.expect_read().returning(move |_| {
            readings
                .next()
                .unwrap_or(Ok(None))
                .map(|raw| raw.map(String::from))
        });
        source
    }

    #[tokio::test]
    async fn repeated_value_is_not_delivered() {
        let (slot, mut rx) = open_slot("42000");
        let source = scripted(vec![Ok(Some("42000")), Ok(Some("42500"))]);

        assert_eq!(
            poll_once(&slot, &source, READ_TIMEOUT).await,
            PollOutcome::Unchanged
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            poll_once(&slot, &source, READ_TIMEOUT).await,
            PollOutcome::Changed(FanoutReport {
                delivered: 1,
                failed: 0
            })
        );
        assert_eq!(rx.try_recv().unwrap().value.as_str(), "42500");
    }

    #[tokio::test]
    async fn failed_read_keeps_cache() {
        let (slot, mut rx) = open_slot("7");
        let source = scripted(vec![
            Err(SourceError::Failed("page reloading".to_string())),
            Ok(Some("7")),
        ]);

        assert_eq!(
            poll_once(&slot, &source, READ_TIMEOUT).await,
            PollOutcome::Failed
        );
        assert_eq!(
            poll_once(&slot, &source, READ_TIMEOUT).await,
            PollOutcome::Unchanged
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_and_garbage_readings_are_skipped() {
        let (slot, mut rx) = open_slot("7");
        let source = scripted(vec![Ok(None), Ok(Some("--")), Ok(Some(""))]);

        for _ in 0..3 {
            assert_eq!(
                poll_once(&slot, &source, READ_TIMEOUT).await,
                PollOutcome::Empty
            );
        }
        assert!(rx.try_recv().is_err());
        let cached = slot.state.lock().as_ref().and_then(|s| s.current().cloned());
        assert_eq!(cached.map(|v| v.to_string()), Some("7".to_string()));
    }

    #[tokio::test]
    async fn purged_key_is_not_updated() {
        let (slot, mut rx) = open_slot("7");
        *slot.state.lock() = None;
        let source = scripted(vec![Ok(Some("8"))]);

        assert_eq!(
            poll_once(&slot, &source, READ_TIMEOUT).await,
            PollOutcome::Empty
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_loop_never_reads() {
        let (slot, _rx) = open_slot("7");
        let mut source = MockValueSource::new();
        source.expect_read().times(0);

        let handle = PollHandle::spawn(
            Arc::new(slot),
            Arc::new(source),
            PollSettings {
                settle_delay: Duration::from_secs(3600),
                poll_interval: Duration::from_millis(1),
                read_timeout: READ_TIMEOUT,
            },
            CancellationToken::new(),
        );

        handle.stop().await;
    }
}
