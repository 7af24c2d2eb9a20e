//! Value Source Port (Driven Port)
//!
//! Interface to whatever actually produces values for a key: a scraping
//! session, a REST endpoint, an exchange socket. The engine drives the
//! session lifecycle through it and never sees the underlying handle.

use async_trait::async_trait;

use crate::domain::key::SymbolKey;

/// Errors reported by a value source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The key does not exist or produced no live data.
    #[error("symbol not found or no live data")]
    NotFound,

    /// No session is open for the key.
    #[error("no open session for {0}")]
    NoSession(String),

    /// The source failed for another reason.
    #[error("source failure: {0}")]
    Failed(String),
}

/// Port for reading values from an external source.
///
/// Calls for different keys may run concurrently. For a single key the
/// engine guarantees `open` → `read`* → `close`, with no overlapping reads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValueSource: Send + Sync {
    /// Open a session for `key` and return its first raw reading.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] when the key yields no live data,
    /// or another [`SourceError`] when opening fails.
    async fn open(&self, key: &SymbolKey) -> Result<String, SourceError>;

    /// Read the current raw value from the open session.
    ///
    /// `Ok(None)` means the source answered but had nothing to report.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the read fails.
    async fn read(&self, key: &SymbolKey) -> Result<Option<String>, SourceError>;

    /// Release the session for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if releasing fails. The engine logs it and
    /// purges its own state regardless.
    async fn close(&self, key: &SymbolKey) -> Result<(), SourceError>;

    /// Release any process-wide resources once every session is closed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if releasing fails.
    async fn shutdown(&self) -> Result<(), SourceError> {
        Ok(())
    }
}
