// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Transport-local failures (a peer hanging up, a dropped datagram) are logged
//! where they happen and never surface here. Encryption and section failures
//! stay in `CryptoError` and `SectionError`. What does surface is what a
//! caller can act on: a port that cannot be bound, a target that does not
//! resolve, a configuration that does not validate.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors returned by the public `hmon` API.
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport is disabled by configuration (port 0).
    #[error("{0} is disabled (port 0)")]
    Disabled(&'static str),

    /// Operation not allowed in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// I/O error with underlying cause.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind a listening socket.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Target host did not resolve to a usable address.
    #[error("Cannot resolve {0}")]
    Resolve(String),

    // ========================================================================
    // Owner Errors
    // ========================================================================
    /// The owner-supplied periodic callback reported a failure.
    #[error("Callback failed: {0}")]
    Callback(String),
}

/// Convenient alias for API results using the crate `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
