//! Error types for canopy
//!
//! Provides a unified error type for all topology operations.

use thiserror::Error;

/// Result type alias for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Unified error type for topology operations
///
/// The variants form a closed set: probe classification, relocation
/// failures, recovery coordination failures and store failures. Background
/// loops record these on audit rows; operator-initiated operations surface
/// them directly.
#[derive(Error, Debug)]
pub enum TopologyError {
    // ===== Probe classification =====
    #[error("Instance unreachable: {key}: {reason}")]
    Unreachable { key: String, reason: String },

    #[error("Authentication denied by {key}")]
    AuthDenied { key: String },

    #[error("Protocol mismatch on {key}: {reason}")]
    ProtocolMismatch { key: String, reason: String },

    // ===== Relocation =====
    #[error("No relocation method applies moving {src} below {target}")]
    NoRelocationMethod { src: String, target: String },

    #[error("Pseudo-GTID marker is ambiguous on {key}: {occurrences} occurrences in scan window")]
    AmbiguousPseudoGtid { key: String, occurrences: usize },

    #[error("No shared binlog history between {src} and {target}: {reason}")]
    NoSharedHistory {
        src: String,
        target: String,
        reason: String,
    },

    #[error("Diverged histories: {0}")]
    DivergedHistories(String),

    // ===== Recovery coordination =====
    #[error("Lock contended: {0}")]
    LockContended(String),

    #[error("Recovery blocked: {0}")]
    RecoveryBlocked(String),

    // ===== Cross-cutting =====
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("External hook failed: {0}")]
    ExternalHookFailed(String),

    /// Programming error: logged at high severity, never retried.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl TopologyError {
    /// Whether the error marks the probed instance stale.
    ///
    /// Auth and protocol failures prove the server is alive; only transport
    /// failures invalidate the last check.
    pub fn invalidates_last_check(&self) -> bool {
        matches!(self, TopologyError::Unreachable { .. } | TopologyError::Timeout(_))
    }
}
