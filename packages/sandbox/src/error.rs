// ABOUTME: Error types for bundle lifecycle operations
// ABOUTME: Taxonomy surfaced to the transport layer: missing bundle, no entry point, runtime and path failures

use crate::providers::ProviderError;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bundle directory does not exist
    #[error("Bundle not found: {0}")]
    NotFound(String),

    /// Nothing runnable found at the bundle root
    #[error("No entry point found for bundle {bundle_id}: {reason}")]
    NoEntryPoint { bundle_id: String, reason: String },

    /// The container service rejected create, start or stop
    #[error("Sandbox runtime failure: {0}")]
    RuntimeFailure(#[from] ProviderError),

    /// Requested file path escapes the bundle root
    #[error("Path rejected: {0}")]
    PathRejected(String),

    /// Bundle identifier failed validation
    #[error("Invalid bundle id '{id}': {reason}")]
    InvalidBundleId { id: String, reason: String },

    /// A background lifecycle task panicked
    #[error("Lifecycle task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Filesystem error while managing bundle directories
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the caller sent something that can never succeed as-is
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_)
                | EngineError::NoEntryPoint { .. }
                | EngineError::PathRejected(_)
                | EngineError::InvalidBundleId { .. }
        )
    }
}

/// Type alias for Results that return EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
