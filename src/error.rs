//! Error types for the Gatekeeper admission layer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Gatekeeper operations.
///
/// None of these ever reach a caller of the admission pipeline: the
/// pipeline resolves configuration errors by falling back to defaults and
/// store errors by failing open. They surface from configuration loading,
/// administrative operations, and the command-line tool.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
