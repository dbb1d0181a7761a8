//! Error types for the Eventline runtime

use std::io;

use eventline_core::{ConfigError, StoreError};

// ----------------------------------------------------------------------------
// Runtime Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the broker and communicator lifecycles
///
/// Everything here happens at startup (configuration, store opening, socket
/// binding). Faults on a live link are contained and logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to bind broker listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("broker is already listening")]
    AlreadyListening,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
