//! Fan-out
//!
//! Delivers one update to a snapshot of listeners. Each delivery is isolated:
//! an error or panic in one listener is logged and counted, and every other
//! listener still receives the update. Nothing is ever propagated back into
//! the poll loop.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::join_all;

use crate::application::ports::{DeliveryError, SharedListener};
use crate::domain::price::PriceUpdate;
use crate::domain::subscription::ListenerId;
use crate::infrastructure::metrics;

/// Result of fanning one update out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Listeners that accepted the update.
    pub delivered: usize,
    /// Listeners whose delivery failed.
    pub failed: usize,
}

/// Deliver `update` to every listener in `listeners`.
///
/// Deliveries to distinct listeners run concurrently; the call returns once
/// all of them have finished, so a later call for the same key never
/// overtakes this one.
pub async fn notify(
    update: &PriceUpdate,
    listeners: &[(ListenerId, SharedListener)],
) -> FanoutReport {
    let outcomes = join_all(
        listeners
            .iter()
            .map(|(id, listener)| deliver_one(update, *id, listener)),
    )
    .await;

    let delivered = outcomes.iter().filter(|ok| **ok).count();
    let report = FanoutReport {
        delivered,
        failed: outcomes.len() - delivered,
    };

    metrics::record_notifications(report.delivered as u64);
    metrics::record_delivery_failures(report.failed as u64);
    report
}

/// Deliver to a single listener. Returns whether delivery succeeded.
pub async fn deliver_one(
    update: &PriceUpdate,
    id: ListenerId,
    listener: &SharedListener,
) -> bool {
    let result = AssertUnwindSafe(listener.deliver(update))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(DeliveryError::Failed(panic_message(&*panic))));

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                key = %update.key,
                listener = %id,
                error = %e,
                "Listener delivery failed"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic.downcast_ref::<&str>().map_or_else(
        || {
            panic.downcast_ref::<String>().map_or_else(
                || "listener panicked".to_string(),
                |msg| format!("listener panicked: {msg}"),
            )
        },
        |msg| format!("listener panicked: {msg}"),
    )
}
