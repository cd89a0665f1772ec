//! Error types for the Observer evolution system
//!
//! This module provides structured error definitions using thiserror. Most
//! variants are recoverable at the orchestrator boundary: insufficient data
//! skips a subsystem for one cycle, commit conflicts schedule a retry and
//! malformed feedback is dropped per item.

use crate::evolution::config::ConfigError;
use crate::evolution::proposal::EvolutionSubsystem;
use thiserror::Error;

/// Main error type for evolution operations
#[derive(Error, Debug)]
pub enum EvolutionError {
    /// Evaluation window too small to produce a meaningful proposal
    #[error("Insufficient data for {subsystem} evolution: {reason}")]
    InsufficientData {
        subsystem: EvolutionSubsystem,
        reason: String,
    },

    /// Two proposals could not be ordered
    #[error("Conflicting proposals for {target}: {reason}")]
    Conflict { target: String, reason: String },

    /// Optimistic version check failed at commit time
    #[error("Commit conflict on {target}: expected version {expected:?}, found {found:?}")]
    CommitConflict {
        target: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Feedback entry missing a required field
    #[error("Malformed feedback {id}: {reason}")]
    MalformedFeedback { id: String, reason: String },

    /// Parameter value outside its valid range
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl EvolutionError {
    /// Errors that should lead to the same change being retried next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvolutionError::CommitConflict { .. }
                | EvolutionError::Storage(_)
                | EvolutionError::Database(_)
        )
    }

    /// Errors that only mean "nothing to do this cycle"
    pub fn is_skippable(&self) -> bool {
        matches!(self, EvolutionError::InsufficientData { .. })
    }
}

/// Result type alias for evolution operations
pub type Result<T> = std::result::Result<T, EvolutionError>;

/// Convert anyhow::Error to EvolutionError
impl From<anyhow::Error> for EvolutionError {
    fn from(err: anyhow::Error) -> Self {
        EvolutionError::Other(err.to_string())
    }
}
