//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors, raised at construction time only
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input that cannot be turned into a bucket key
    #[error("Classification error: {0}")]
    Classification(String),

    /// The counter store cannot be reached or an operation timed out
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Decoded store state violates a bucket invariant
    #[error("Store state inconsistent: {0}")]
    StoreInconsistent(String),

    /// A per-request deadline elapsed
    #[error("Operation deadline elapsed")]
    Deadline,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
