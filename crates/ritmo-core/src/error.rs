//! Ritmo error type.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RitmoError>;

/// Every failure the cadence engine can report.
///
/// Stale-state situations (a quote closed or resent while one of its events
/// was claimed) are not errors; they come back as regular outcomes.
#[derive(Debug, Error)]
pub enum RitmoError {
    /// Bad startup configuration: unknown timezone, malformed holiday table,
    /// unparsable time of day. Not recoverable per call.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Quote not found: {0}")]
    QuoteNotFound(String),

    #[error("Cadence event not found: {0}")]
    EventNotFound(String),

    #[error("Follow-up task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Transient delivery failure; the claim is released for another attempt.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lookup error: {0}")]
    Lookup(String),

    /// A persisted invariant does not hold. Never retried.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
