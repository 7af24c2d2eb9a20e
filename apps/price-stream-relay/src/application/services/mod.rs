//! Application Services
//!
//! - `StreamEngine`: subscription registry, session lifecycle, and polling
//! - `fanout`: isolated delivery of one update to a set of listeners

pub mod engine;
pub mod fanout;
mod poller;

pub use engine::{EngineError, EngineSettings, EngineStats, StreamEngine};
pub use fanout::FanoutReport;
