//! Error taxonomy for the analysis core.
//!
//! Pipeline-internal plumbing uses `anyhow::Result`; the variants here are
//! the errors that cross the crate boundary and that an HTTP adapter is
//! expected to map onto its own status codes.

use thiserror::Error;

/// Errors surfaced by core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A rule failed validation or pattern compilation.
    #[error("rule {rule_id:?} pattern {pattern_index}: {reason}")]
    RuleCompile {
        /// Offending rule id, if the rule already has one.
        rule_id: Option<String>,
        /// Index of the offending pattern within the rule.
        pattern_index: usize,
        /// Human-readable compile failure.
        reason: String,
    },

    /// Malformed search options.
    #[error("invalid search: {reason}")]
    InvalidSearch { reason: String },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("rule {0} not found")]
    RuleNotFound(String),

    #[error("service for port {0} not found")]
    ServiceNotFound(u16),

    /// A packet source could not be opened or died mid-read. The owning
    /// session moves to a terminal state with the cause recorded.
    #[error("source {src} unavailable: {cause}")]
    SourceUnavailable { src: String, cause: String },

    /// Document store failure. Bubbled per-operation; the pipeline keeps
    /// running where it can.
    #[error("storage error: {cause}")]
    Storage { cause: String },

    /// A resource ceiling was hit (flow table, buffered bytes).
    #[error("resource exhausted: {kind}")]
    ResourceExhausted { kind: String },

    /// A capture is already running, or none is.
    #[error("{0}")]
    CaptureState(String),
}

impl CoreError {
    pub(crate) fn storage<E: std::fmt::Display>(e: E) -> Self {
        CoreError::Storage {
            cause: e.to_string(),
        }
    }

    pub(crate) fn source<E: std::fmt::Display>(source: &str, e: E) -> Self {
        CoreError::SourceUnavailable {
            src: source.to_string(),
            cause: e.to_string(),
        }
    }
}
