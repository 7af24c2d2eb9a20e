//! Listener Port (Driven Port)
//!
//! A listener is a consumer's registered capability to receive
//! `(key, value)` notifications. The transport behind it (an SSE stream, a
//! socket, an in-process channel) is invisible to the engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::price::PriceUpdate;
use crate::domain::subscription::ListenerId;

/// Delivery errors. Always contained by the engine, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The consumer is not keeping up and its queue is full.
    #[error("listener queue is full")]
    Backpressure,

    /// The consumer went away.
    #[error("listener disconnected")]
    Disconnected,

    /// Delivery failed for another reason.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Port for notifying a consumer.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Identity the listener is registered under.
    fn id(&self) -> ListenerId;

    /// Deliver one update.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the consumer could not take the update.
    async fn deliver(&self, update: &PriceUpdate) -> Result<(), DeliveryError>;
}

/// Shared listener handle as stored by the engine.
pub type SharedListener = Arc<dyn Listener>;
