//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Sessions**: Open sessions, open attempts by outcome, open latency
//! - **Listeners**: Registered listeners across all keys
//! - **Polling**: Poll ticks by outcome
//! - **Delivery**: Notifications sent, delivery and teardown failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns [`BuildError`] if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Session metrics
    describe_gauge!(
        "relay_sessions_open",
        "Number of keys with an open source session"
    );
    describe_counter!(
        "relay_session_opens_total",
        "Session open attempts by outcome"
    );
    describe_histogram!(
        "relay_session_open_seconds",
        "Time spent opening a source session"
    );

    // Listener gauge
    describe_gauge!(
        "relay_listeners",
        "Number of registered listeners across all keys"
    );

    // Polling
    describe_counter!("relay_polls_total", "Poll ticks by outcome");

    // Delivery
    describe_counter!(
        "relay_notifications_total",
        "Updates delivered to listeners"
    );
    describe_counter!(
        "relay_delivery_failures_total",
        "Listener deliveries that failed or panicked"
    );
    describe_counter!(
        "relay_teardown_failures_total",
        "Source sessions that failed to close cleanly"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Outcome label for session open attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Session opened with a valid initial value.
    Ok,
    /// The source had no live data or returned an unusable value.
    Invalid,
    /// Opening exceeded the open timeout.
    Timeout,
    /// The source failed for another reason.
    Error,
}

impl OpenOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Invalid => "invalid",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Outcome label for poll ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcomeLabel {
    /// The value changed and was fanned out.
    Changed,
    /// The value equalled the cache.
    Unchanged,
    /// Nothing usable was read.
    Empty,
    /// The read failed or timed out.
    Failed,
}

impl PollOutcomeLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
            Self::Empty => "empty",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a session open attempt.
pub fn record_session_open(outcome: OpenOutcome) {
    counter!(
        "relay_session_opens_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record how long a session open took.
pub fn record_open_duration(duration: Duration) {
    histogram!("relay_session_open_seconds").record(duration.as_secs_f64());
}

/// Record one poll tick.
pub fn record_poll(outcome: PollOutcomeLabel) {
    counter!(
        "relay_polls_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record updates delivered to listeners.
pub fn record_notifications(count: u64) {
    if count > 0 {
        counter!("relay_notifications_total").increment(count);
    }
}

/// Record failed deliveries.
pub fn record_delivery_failures(count: u64) {
    if count > 0 {
        counter!("relay_delivery_failures_total").increment(count);
    }
}

/// Record a session that did not close cleanly.
pub fn record_teardown_failure() {
    counter!("relay_teardown_failures_total").increment(1);
}

/// Update the open session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_open(count: usize) {
    gauge!("relay_sessions_open").set(count as f64);
}

/// Update the registered listener count.
#[allow(clippy::cast_precision_loss)]
pub fn set_listeners(count: usize) {
    gauge!("relay_listeners").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_outcome_as_str() {
        assert_eq!(OpenOutcome::Ok.as_str(), "ok");
        assert_eq!(OpenOutcome::Invalid.as_str(), "invalid");
        assert_eq!(OpenOutcome::Timeout.as_str(), "timeout");
        assert_eq!(OpenOutcome::Error.as_str(), "error");
    }

    #[test]
    fn poll_outcome_as_str() {
        assert_eq!(PollOutcomeLabel::Changed.as_str(), "changed");
        assert_eq!(PollOutcomeLabel::Unchanged.as_str(), "unchanged");
        assert_eq!(PollOutcomeLabel::Empty.as_str(), "empty");
        assert_eq!(PollOutcomeLabel::Failed.as_str(), "failed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_session_open(OpenOutcome::Ok);
        record_poll(PollOutcomeLabel::Unchanged);
        record_notifications(3);
        set_listeners(2);
    }
}
