//! Channel Listener Adapter
//!
//! Bridges the engine's [`Listener`] port onto a bounded tokio mpsc
//! channel. Delivery never waits: a full queue is reported as
//! backpressure, a dropped receiver as a disconnect. The engine logs both
//! and keeps serving everyone else.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::{DeliveryError, Listener};
use crate::domain::price::PriceUpdate;
use crate::domain::subscription::ListenerId;

/// Listener that forwards updates into an mpsc channel.
///
/// # Example
///
/// ```rust
/// use price_stream_relay::ChannelListener;
///
/// let (listener, mut rx) = ChannelListener::new(16);
/// assert!(rx.try_recv().is_err());
/// # drop(listener);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelListener {
    id: ListenerId,
    tx: mpsc::Sender<PriceUpdate>,
}

impl ChannelListener {
    /// Create a listener with a fresh identity and a queue of `capacity`.
    ///
    /// `capacity` is clamped to at least one.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PriceUpdate>) {
        Self::with_id(ListenerId::new(), capacity)
    }

    /// Create a listener registered under `id`.
    #[must_use]
    pub fn with_id(id: ListenerId, capacity: usize) -> (Self, mpsc::Receiver<PriceUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    /// Whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Listener for ChannelListener {
    fn id(&self) -> ListenerId {
        self.id
    }

    async fn deliver(&self, update: &PriceUpdate) -> Result<(), DeliveryError> {
        self.tx.try_send(update.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backpressure,
            TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}
