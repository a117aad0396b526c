//! Error taxonomy shared by every qrlink crate.

use thiserror::Error;

/// Errors produced while driving a link session or talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Empty or malformed account token passed to `start`.
    #[error("invalid account token: {0}")]
    InvalidToken(String),

    /// The QR fetch failed; terminal for the current attempt.
    #[error("QR fetch failed: {0}")]
    QrFetch(String),

    /// A status poll failed; recovered locally and never surfaced as a phase change.
    #[error("status poll failed: {0}")]
    TransientPoll(String),

    /// An async result arrived after the session it was issued for stopped being current.
    #[error("stale result discarded")]
    StaleResult,

    /// Network-level failure or non-success HTTP status from the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `start` was called with no tokio runtime reachable.
    #[error("no tokio runtime available to schedule session work")]
    NoRuntime,

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {0}")]
    Config(String),
}

impl LinkError {
    /// Whether this error only reflects a discarded stale result.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleResult)
    }
}
