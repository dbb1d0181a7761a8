//! Error types for the Eventline core
//!
//! This module contains the error types used by the protocol codec, the
//! durable event stores, and configuration validation, plus the unified
//! `EventlineError` that wraps them all.

use std::path::PathBuf;

// ----------------------------------------------------------------------------
// Frame Errors
// ----------------------------------------------------------------------------

/// Errors produced while decoding inbound frames
///
/// Frame errors are protocol faults: the caller logs and drops the offending
/// frame, the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is missing the protocol marker")]
    MissingMarker,
}

// ----------------------------------------------------------------------------
// Store Errors
// ----------------------------------------------------------------------------

/// Errors produced by the durable event stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot {path} is not a valid queue snapshot: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors produced by configuration validation
///
/// These are the only fatal class: callers report them once and exit before
/// binding any socket.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("secret key must not be empty")]
    MissingSecretKey,
    #[error("broker host must not be empty")]
    MissingHost,
    #[error("broker port must not be zero")]
    InvalidPort,
    #[error("storage path for the {role} queue must not be empty")]
    MissingStoragePath { role: &'static str },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the Eventline core
#[derive(Debug, thiserror::Error)]
pub enum EventlineError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EventlineError>;
