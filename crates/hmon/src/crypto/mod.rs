// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-secret payload encryption for both transports.
//!
//! Every encrypted payload, TCP reply or realtime datagram body, goes through
//! a [`Commander`]. The envelope is self-contained:
//!
//! ```text
//! +-------------------+
//! | nonce             | 12 bytes (random per payload)
//! +-------------------+
//! | ciphertext        |  N bytes (same length as plaintext)
//! +-------------------+
//! | GCM tag           | 16 bytes
//! +-------------------+
//! ```
//!
//! # Security Properties
//!
//! - **Confidentiality**: AES-256-GCM
//! - **Integrity**: a wrong secret or a flipped bit fails tag verification
//! - **Key**: PBKDF2-HMAC-SHA256 over the configured password
//!
//! Best-effort only: this protects monitoring data on a LAN. It does not
//! authenticate stations, does not prevent replay and makes no side-channel
//! claims beyond what `ring` provides.

mod commander;

pub use commander::{Commander, KEY_LEN, NONCE_LEN, OVERHEAD, TAG_LEN};

use thiserror::Error;

/// Encryption/decryption failures.
///
/// A decode failure is an ordinary outcome for noise or foreign traffic; it is
/// reported, and the input is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The system CSPRNG failed; we refuse to encrypt with a predictable nonce.
    #[error("random source failed")]
    RandomSource,

    /// Sealing the payload failed.
    #[error("encryption failed")]
    Encrypt,

    /// Input is shorter than nonce plus tag.
    #[error("ciphertext too short: {len} bytes (min {min})")]
    TooShort {
        /// Supplied length
        len: usize,
        /// Minimum envelope length
        min: usize,
    },

    /// Declared length exceeds the buffer that holds it.
    #[error("length {length} exceeds buffer capacity {capacity}")]
    LengthOutOfBounds {
        /// Declared payload length
        length: usize,
        /// Buffer capacity
        capacity: usize,
    },

    /// Tag verification failed: wrong secret or tampered data.
    #[error("authentication failed (wrong secret or tampered payload)")]
    Authentication,
}
