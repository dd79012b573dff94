//! Unified error type for every core operation.
//!
//! `CoreError` is the single error type returned across the public surface.
//! It serializes as `{ "kind": "...", "message": "..." }` so a presentation
//! layer can distinguish retryable conditions from fatal ones.

use serde::ser::SerializeStruct;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Per-target and per-flow failures (`ProbeFailed`, `MechanismUnavailable`) are
/// normally contained by the component that raised them. Only chain exhaustion
/// and input validation are expected to reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Worker pool, socket pool or cache pressure. Retryable.
    #[error("{0}")]
    ResourceExhausted(String),

    /// A single scan target or metadata lookup failed.
    #[error("{0}")]
    ProbeFailed(String),

    /// One enforcement mechanism could not be used; the next one should be tried.
    #[error("{0}")]
    MechanismUnavailable(String),

    /// Every enforcement mechanism in a chain failed.
    #[error("{action} failed: no enforcement mechanism succeeded (tried: {})", .attempts.join(", "))]
    AllMechanismsFailed { action: String, attempts: Vec<String> },

    /// Invalid address, port or parameter; rejected before any OS call.
    #[error("{0}")]
    MalformedTarget(String),

    /// Unknown rule id or similar lookup miss.
    #[error("{0}")]
    NotFound(String),

    /// Errors originating from SQLite / persistence.
    #[error("{0}")]
    Database(String),

    /// I/O and OS-level errors (process spawning, sockets, filesystem).
    #[error("{0}")]
    Io(String),
}

impl CoreError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ResourceExhausted(_) => "ResourceExhausted",
            CoreError::ProbeFailed(_) => "ProbeFailed",
            CoreError::MechanismUnavailable(_) => "MechanismUnavailable",
            CoreError::AllMechanismsFailed { .. } => "AllMechanismsFailed",
            CoreError::MalformedTarget(_) => "MalformedTarget",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Database(_) => "Database",
            CoreError::Io(_) => "Io",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ResourceExhausted(_))
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("CoreError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Database(format!("{err:#}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.to_string())
    }
}
