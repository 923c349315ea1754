//! Error taxonomy shared across the engine.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified outcome of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Timeout,
    AuthFailed,
    InvalidResponse,
    BackendUnavailable,
    BudgetExceeded,
    CircuitOpen,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::AuthFailed => "auth_failed",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::BackendUnavailable => "backend_unavailable",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Worth retrying against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::RateLimited | FailureKind::BackendUnavailable
        )
    }

    /// Refused locally without contacting the backend; the cascade moves on
    /// immediately.
    pub fn is_skip(&self) -> bool {
        matches!(self, FailureKind::BudgetExceeded | FailureKind::CircuitOpen)
    }

    /// Counts against the backend's circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::RateLimited
                | FailureKind::BackendUnavailable
                | FailureKind::AuthFailed
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limited" => Ok(FailureKind::RateLimited),
            "timeout" => Ok(FailureKind::Timeout),
            "auth_failed" => Ok(FailureKind::AuthFailed),
            "invalid_response" => Ok(FailureKind::InvalidResponse),
            "backend_unavailable" => Ok(FailureKind::BackendUnavailable),
            "budget_exceeded" => Ok(FailureKind::BudgetExceeded),
            "circuit_open" => Ok(FailureKind::CircuitOpen),
            "cancelled" => Ok(FailureKind::Cancelled),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// A failed call against one backend.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{backend}: {kind}: {message}")]
pub struct BackendFailure {
    pub backend: String,
    pub kind: FailureKind,
    pub message: String,
}

impl BackendFailure {
    pub fn new(backend: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised by the graph and enrichment stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("graph not found for repository {0}")]
    NotFound(String),

    #[error("graph corrupt at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the graph should be treated as absent for routing purposes.
    pub fn is_missing_graph(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Corrupt { .. })
    }
}

/// Failure to resolve the repository head revision.
#[derive(Error, Debug)]
pub enum VcsError {
    #[error("VCS command failed: {0}")]
    Command(String),

    #[error("VCS command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Query-time failures. "No matches" is never an error; these mean the
/// question could not be answered at all.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("graph unavailable ({graph}) and fallback search failed ({fallback})")]
    Unavailable { graph: String, fallback: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure of one repository enrichment run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("run cancelled")]
    Cancelled,

    #[error("run exceeded its deadline of {0:?}")]
    Timeout(std::time::Duration),

    #[error("run crashed: {0}")]
    Crashed(String),
}

impl RunError {
    /// Short machine-readable reason recorded in the run state.
    pub fn reason(&self) -> &'static str {
        match self {
            RunError::Store(_) => "store",
            RunError::Cancelled => "cancelled",
            RunError::Timeout(_) => "timeout",
            RunError::Crashed(_) => "crashed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_roundtrip() {
        for kind in [
            FailureKind::RateLimited,
            FailureKind::Timeout,
            FailureKind::AuthFailed,
            FailureKind::InvalidResponse,
            FailureKind::BackendUnavailable,
            FailureKind::BudgetExceeded,
            FailureKind::CircuitOpen,
            FailureKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<FailureKind>().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
        assert!(FailureKind::BackendUnavailable.is_transient());
        assert!(!FailureKind::AuthFailed.is_transient());
        assert!(!FailureKind::InvalidResponse.is_transient());
        assert!(!FailureKind::BudgetExceeded.is_transient());

        assert!(FailureKind::BudgetExceeded.is_skip());
        assert!(FailureKind::CircuitOpen.is_skip());
        assert!(!FailureKind::Timeout.is_skip());

        assert!(!FailureKind::InvalidResponse.trips_breaker());
    }

    #[test]
    fn test_missing_graph_errors() {
        assert!(StoreError::NotFound("r".into()).is_missing_graph());
        assert!(
            StoreError::Corrupt {
                path: "g.json".into(),
                reason: "eof".into()
            }
            .is_missing_graph()
        );
        assert!(!StoreError::Io(std::io::Error::other("disk")).is_missing_graph());
    }
}
