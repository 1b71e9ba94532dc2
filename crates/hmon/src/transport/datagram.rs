// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Realtime datagram frame.
//!
//! # Wire Format
//!
//! ```text
//! +-------------------+
//! | kind              |  2 bytes ASCII: "00" plain, "99" encrypted
//! +-------------------+
//! | timestamp         | 10 bytes ASCII decimal, seconds since epoch
//! +-------------------+
//! | body              |  N bytes (section text, or a Commander envelope)
//! +-------------------+
//! ```
//!
//! The header is never encrypted so a receiver can reject foreign traffic
//! before spending a decryption on it.

use crate::crypto::{Commander, CryptoError};
use thiserror::Error;

/// Length of the kind marker.
pub const KIND_LEN: usize = 2;

/// Length of the ASCII timestamp.
pub const TIMESTAMP_LEN: usize = 10;

/// Offset of the body within a datagram.
pub const DATA_OFFSET: usize = KIND_LEN + TIMESTAMP_LEN;

/// Marker for a plaintext body.
pub const KIND_PLAIN: [u8; KIND_LEN] = *b"00";

/// Marker for an encrypted body.
pub const KIND_ENCRYPTED: [u8; KIND_LEN] = *b"99";

const TIMESTAMP_MODULUS: u64 = 10_000_000_000;

/// Frame decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    #[error("datagram too short: {0} bytes (header is 12)")]
    TooShort(usize),

    #[error("unknown datagram kind {0:?}")]
    UnknownKind([u8; KIND_LEN]),

    #[error("malformed timestamp")]
    BadTimestamp,

    #[error("encrypted datagram but no secret configured")]
    MissingSecret,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Borrowed view of a parsed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    /// Body is a Commander envelope.
    pub encrypted: bool,
    /// Sender clock, seconds since epoch.
    pub timestamp: u64,
    /// Body bytes after the header.
    pub body: &'a [u8],
}

/// Decrypted datagram contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimePacket {
    /// Sender clock, seconds since epoch.
    pub timestamp: u64,
    /// Section text.
    pub payload: Vec<u8>,
}

/// Build a frame around an already encoded body.
pub fn encode(body: &[u8], encrypted: bool, timestamp: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DATA_OFFSET + body.len());
    frame.extend_from_slice(if encrypted { &KIND_ENCRYPTED } else { &KIND_PLAIN });
    let stamp = format!("{:010}", timestamp % TIMESTAMP_MODULUS);
    frame.extend_from_slice(stamp.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Split a frame into header fields and body.
pub fn parse(bytes: &[u8]) -> Result<Datagram<'_>, DatagramError> {
    if bytes.len() < DATA_OFFSET {
        return Err(DatagramError::TooShort(bytes.len()));
    }

    let mut kind = [0u8; KIND_LEN];
    kind.copy_from_slice(&bytes[..KIND_LEN]);
    let encrypted = match kind {
        KIND_PLAIN => false,
        KIND_ENCRYPTED => true,
        other => return Err(DatagramError::UnknownKind(other)),
    };

    let stamp = &bytes[KIND_LEN..DATA_OFFSET];
    if !stamp.iter().all(u8::is_ascii_digit) {
        return Err(DatagramError::BadTimestamp);
    }
    let timestamp = stamp
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));

    Ok(Datagram {
        encrypted,
        timestamp,
        body: &bytes[DATA_OFFSET..],
    })
}

/// Parse a frame and decrypt its body when needed.
pub fn open(bytes: &[u8], commander: Option<&Commander>) -> Result<RealtimePacket, DatagramError> {
    let frame = parse(bytes)?;
    let payload = if frame.encrypted {
        commander
            .ok_or(DatagramError::MissingSecret)?
            .decode(frame.body)?
    } else {
        frame.body.to_vec()
    };

    Ok(RealtimePacket {
        timestamp: frame.timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_frame_layout() {
        let frame = encode(b"<<<mem>>>\n", false, 1_767_225_600);
        assert_eq!(&frame[..DATA_OFFSET], b"001767225600");
        assert_eq!(&frame[DATA_OFFSET..], b"<<<mem>>>\n");
    }

    #[test]
    fn test_timestamp_zero_padded() {
        let frame = encode(b"", true, 42);
        assert_eq!(&frame[..DATA_OFFSET], b"990000000042");
        assert_eq!(parse(&frame).unwrap().timestamp, 42);
    }

    #[test]
    fn test_encrypted_open() {
        let commander = Commander::new("axecerc");
        let body = commander.encode(b"<<<df>>>\n/ 100 50\n").unwrap();
        let frame = encode(&body, true, 1000);

        let packet = open(&frame, Some(&commander)).unwrap();
        assert_eq!(packet.timestamp, 1000);
        assert_eq!(packet.payload, b"<<<df>>>\n/ 100 50\n");
    }

    #[test]
    fn test_encrypted_without_secret() {
        let body = Commander::new("x").encode(b"a").unwrap();
        let frame = encode(&body, true, 1);
        assert_eq!(open(&frame, None), Err(DatagramError::MissingSecret));
    }

    #[test]
    fn test_wrong_secret_is_crypto_error() {
        let body = Commander::new("right").encode(b"a").unwrap();
        let frame = encode(&body, true, 1);
        assert_eq!(
            open(&frame, Some(&Commander::new("wrong"))),
            Err(DatagramError::Crypto(CryptoError::Authentication))
        );
    }

    #[test]
    fn test_foreign_traffic_rejected() {
        assert_eq!(parse(b"short"), Err(DatagramError::TooShort(5)));
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\n"),
            Err(DatagramError::UnknownKind(*b"GE"))
        );
        assert_eq!(parse(b"00abcdefghij"), Err(DatagramError::BadTimestamp));
    }
}
