//! Typed errors surfaced at the engine boundary.
//!
//! Load and dispatch failures propagate to callers as [`EngineError`].
//! Fetch and extraction failures are represented here too, but the engine
//! recovers them locally (logged, replaced by an empty body or a
//! placeholder) and never returns them from a public operation.

use std::path::PathBuf;

use thiserror::Error;

use crate::rule::Operation;

/// Result alias for public engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The rule source could not be read, decoded, executed or normalized.
    #[error("failed to load rule {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// Script execution exceeded the load budget.
    #[error("rule {path} exceeded its {budget_ms} ms execution budget")]
    Timeout { path: PathBuf, budget_ms: u64 },

    /// The rule declares no usable implementation for a required operation.
    #[error("rule '{rule}' does not implement {operation}")]
    NotImplemented { rule: String, operation: Operation },

    /// The rule's own implementation raised while running an operation.
    #[error("rule '{rule}' failed in {operation}: {message}")]
    Script {
        rule: String,
        operation: Operation,
        message: String,
    },

    /// A network fetch failed. Recovered as an empty body.
    #[error("fetch {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    /// A single field or item could not be extracted. Recovered with a default.
    #[error("extraction of '{field}' failed: {reason}")]
    Extraction { field: String, reason: String },

    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        EngineError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn script(
        rule: impl Into<String>,
        operation: Operation,
        message: impl std::fmt::Display,
    ) -> Self {
        EngineError::Script {
            rule: rule.into(),
            operation,
            message: message.to_string(),
        }
    }

    /// Returns `true` for the timeout variant, so callers can tell a slow or
    /// broken rule apart from an unreachable site.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}
