//! Session Lifecycle
//!
//! Phases a key moves through while the engine owns a polling session for
//! it:
//!
//! ```text
//! Absent ──subscribe──► Opening ──source ok──► Open ──last listener leaves──► Closing ──► Absent
//!                          │
//!                          └──source invalid / error / timeout──► Absent
//! ```
//!
//! There is no separate validation step. Attempting to open a session is
//! how the engine learns whether a symbol produces live data at all.

use serde::Serialize;

/// Lifecycle phase of the session for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No session and no state for the key.
    #[default]
    Absent,
    /// The source is being asked to open a session.
    Opening,
    /// Session open; the poll loop is running.
    Open,
    /// Poll loop stopping and source session being released.
    Closing,
}

impl SessionPhase {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Absent, Self::Opening)
                | (Self::Opening, Self::Open | Self::Absent)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Absent)
        )
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}
