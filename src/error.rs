//! Typed errors for the escalation engine API.
//!
//! Engine operations return these instead of bailing with opaque strings so
//! callers (CLI, daemon, notification actions) can branch on the failure.
//! IO and boundary code still uses `anyhow` with context.

use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A spectrum level outside 1..=10 was requested.
    #[error("invalid spectrum level {0} (expected 1..=10)")]
    InvalidLevel(u8),

    /// No active enforcement session for the user.
    #[error("no active session for user '{0}'")]
    SessionNotFound(String),

    /// A session already exists for the user today.
    #[error("session already active for user '{0}'")]
    SessionAlreadyActive(String),

    /// Bypass requested below the minimum eligible level.
    #[error("bypass not eligible: current level {current} is below minimum {minimum}")]
    BypassNotEligible { current: u8, minimum: u8 },

    /// A bypass grant is already in effect for the session.
    #[error("a bypass is already active for user '{0}'")]
    BypassAlreadyActive(String),

    /// The user declined hijack-mode activation.
    #[error("hijack activation declined for user '{0}'")]
    HijackConfirmationDeclined(String),

    /// No pending suggestion to accept or decline.
    #[error("no pending suggestion for user '{0}'")]
    NoPendingSuggestion(String),

    /// No pending hijack confirmation to answer.
    #[error("no pending hijack confirmation for user '{0}'")]
    NoPendingHijack(String),

    /// An escape attempt was reported while hijack mode was off.
    #[error("hijack mode is not active for user '{0}'")]
    HijackNotActive(String),

    /// The escalation schedule in config failed validation.
    #[error("invalid escalation schedule: {0}")]
    InvalidSchedule(String),

    /// Durable store failure.
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),
}
