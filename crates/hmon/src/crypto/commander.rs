// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AES-256-GCM commander keyed from a password.

use super::CryptoError;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
};
use ring::error::Unspecified;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::num::NonZeroU32;
use zeroize::Zeroize;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// GCM nonce length, carried in front of every envelope.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Bytes an envelope adds on top of the plaintext.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Fixed salt: both ends derive the key from the password alone.
const KDF_SALT: &[u8] = b"hmon-agent/commander/v1";

const KDF_ITERATIONS: u32 = 4096;

/// Associated data binding envelopes to this protocol.
const AAD_CONTEXT: &[u8] = b"hmon";

/// Encrypts outgoing payloads and validates incoming ones with a shared secret.
///
/// Cheap to share behind an `Arc`; every call builds its own ring key.
///
/// # Example
///
/// ```
/// use hmon::crypto::Commander;
///
/// let commander = Commander::new("secret");
/// let sealed = commander.encode(b"<<<check_mk>>>\n").unwrap();
/// assert_eq!(commander.decode(&sealed).unwrap(), b"<<<check_mk>>>\n");
/// ```
pub struct Commander {
    key: [u8; KEY_LEN],
}

impl Commander {
    /// Derive a commander from the configured password.
    pub fn new(password: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        // 4096 is a non-zero literal
        let iterations = NonZeroU32::new(KDF_ITERATIONS).unwrap_or(NonZeroU32::MIN);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            KDF_SALT,
            password.as_bytes(),
            &mut key,
        );
        Self { key }
    }

    /// Build a commander from raw key material.
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Length of the envelope produced for `plain_len` bytes of plaintext.
    pub const fn encoded_len(plain_len: usize) -> usize {
        plain_len + OVERHEAD
    }

    /// Encrypt `plaintext` into a self-contained envelope.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;
        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::Encrypt)?;
        let mut sealing_key = SealingKey::new(unbound_key, FixedNonceSequence::new(nonce));

        let mut body = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::from(AAD_CONTEXT), &mut body)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + body.len());
        envelope.extend_from_slice(&nonce);
        envelope.append(&mut body);
        Ok(envelope)
    }

    /// Decrypt the first `length` bytes of `buffer` in place.
    ///
    /// On success the plaintext occupies `buffer[..n]` and `n` is returned.
    /// Nothing outside `buffer[..length]` is read or written. On failure the
    /// contents of `buffer[..length]` are unspecified and must be discarded.
    pub fn decode_in_place(&self, buffer: &mut [u8], length: usize) -> Result<usize, CryptoError> {
        if length > buffer.len() {
            return Err(CryptoError::LengthOutOfBounds {
                length,
                capacity: buffer.len(),
            });
        }
        if length < OVERHEAD {
            return Err(CryptoError::TooShort {
                len: length,
                min: OVERHEAD,
            });
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buffer[..NONCE_LEN]);

        let unbound_key =
            UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::Authentication)?;
        let mut opening_key = OpeningKey::new(unbound_key, FixedNonceSequence::new(nonce));

        let plain_len = opening_key
            .open_in_place(Aad::from(AAD_CONTEXT), &mut buffer[NONCE_LEN..length])
            .map_err(|_| CryptoError::Authentication)?
            .len();

        buffer.copy_within(NONCE_LEN..NONCE_LEN + plain_len, 0);
        Ok(plain_len)
    }

    /// Decrypt an envelope into a fresh buffer.
    pub fn decode(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = envelope.to_vec();
        let plain_len = self.decode_in_place(&mut buffer, envelope.len())?;
        buffer.truncate(plain_len);
        Ok(buffer)
    }
}

impl fmt::Debug for Commander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commander").field("key", &"<redacted>").finish()
    }
}

impl Drop for Commander {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| CryptoError::RandomSource)?;
    Ok(nonce)
}

/// Single-use nonce sequence for ring's `BoundKey` API.
///
/// Hands out its nonce once, then fails.
struct FixedNonceSequence {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl FixedNonceSequence {
    fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for FixedNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        let nonce_bytes = self.nonce.take().ok_or(Unspecified)?;
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_random_payloads() {
        let commander = Commander::new("axecerc");
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for len in [0usize, 1, 15, 16, 17, 255, 1024, 16_000] {
            let plaintext: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
            let envelope = commander.encode(&plaintext).unwrap();
            assert_eq!(envelope.len(), Commander::encoded_len(len));
            assert_eq!(commander.decode(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_same_password_interoperates() {
        let sender = Commander::new("secret");
        let receiver = Commander::new("secret");

        let envelope = sender.encode(b"<<<mem>>>\nMemTotal: 1 kB\n").unwrap();
        assert_eq!(
            receiver.decode(&envelope).unwrap(),
            b"<<<mem>>>\nMemTotal: 1 kB\n"
        );
    }

    #[test]
    fn test_nonce_differs_per_payload() {
        let commander = Commander::new("secret");
        let a = commander.encode(b"same").unwrap();
        let b = commander.encode(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_in_place_moves_plaintext_to_front() {
        let commander = Commander::new("secret");
        let envelope = commander.encode(b"I am test\n").unwrap();

        let mut buffer = envelope.clone();
        buffer.resize(envelope.len() + 1024, 0xEE);
        let n = commander.decode_in_place(&mut buffer, envelope.len()).unwrap();

        assert_eq!(&buffer[..n], b"I am test\n");
        // bytes past the declared length are untouched
        assert!(buffer[envelope.len()..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_wrong_password_fails() {
        let envelope = Commander::new("right").encode(b"payload").unwrap();
        assert_eq!(
            Commander::new("wrong").decode(&envelope),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let commander = Commander::new("secret");
        let mut envelope = commander.encode(b"secret message").unwrap();
        envelope[NONCE_LEN + 3] ^= 0x01;
        assert_eq!(commander.decode(&envelope), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let commander = Commander::new("secret");
        let envelope = commander.encode(b"secret message").unwrap();

        assert_eq!(
            commander.decode(&envelope[..envelope.len() - 1]),
            Err(CryptoError::Authentication)
        );
        assert_eq!(
            commander.decode(&envelope[..OVERHEAD - 1]),
            Err(CryptoError::TooShort {
                len: OVERHEAD - 1,
                min: OVERHEAD
            })
        );
    }

    #[test]
    fn test_length_beyond_buffer_rejected() {
        let commander = Commander::new("secret");
        let mut buffer = commander.encode(b"abc").unwrap();
        let capacity = buffer.len();

        assert_eq!(
            commander.decode_in_place(&mut buffer, capacity + 1),
            Err(CryptoError::LengthOutOfBounds {
                length: capacity + 1,
                capacity
            })
        );
    }

    #[test]
    fn test_noise_is_rejected_not_panicking() {
        let commander = Commander::new("secret");
        let mut rng = fastrand::Rng::with_seed(42);

        for len in 0..128 {
            let mut noise: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
            assert!(commander.decode_in_place(&mut noise, len).is_err());
        }
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", Commander::from_key([0x42; KEY_LEN]));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("42"));
    }
}
