// webfist – email-verified WebFinger delegation
// Copyright © 2023 The webfist authors
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.

//! Encryption of evidence.
//!
//! Evidence is stored encrypted so that the service never publishes message
//! plaintext, and content-addressed by the digest of the ciphertext. For the
//! digest to be reproducible, encryption must be deterministic: the same
//! message for the same address always yields the same ciphertext.

use crate::addr::EmailAddr;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind, Write},
};

/// A capability for encrypting a message on behalf of an address.
///
/// How key material for an address is obtained is up to the implementation.
/// Implementations must be deterministic, or previously issued proofs can no
/// longer be reproduced.
pub trait Encryption: Send + Sync {
    /// Encrypts `plaintext` for `addr`, writing the ciphertext to `out`.
    ///
    /// Output may be written in any number of pieces. An error from `out` must
    /// be returned, not swallowed.
    fn encrypt(&self, addr: &EmailAddr, plaintext: &[u8], out: &mut dyn Write) -> io::Result<()>;
}

/// Size of the plaintext segments sealed individually by [`AddressCipher`].
pub const SEGMENT_SIZE: usize = 4096;

const TAG_LEN: usize = 16;
const PREFIX_LEN: usize = 7;
const KEY_CONTEXT: &[u8] = b"webfist evidence key v1\0";

/// The default encryption scheme, keyed by the address itself.
///
/// The key is derived from the canonical address, so anybody who knows the
/// address can decrypt the evidence, and nobody who does not can.
///
/// Ciphertext format: a 7-byte nonce prefix, followed by the plaintext in
/// segments of [`SEGMENT_SIZE`] bytes, each sealed with ChaCha20-Poly1305
/// under the nonce *prefix ‖ segment counter (u32, big-endian) ‖ last-segment
/// flag*. The nonce prefix is derived from the key and the plaintext, which
/// makes encryption deterministic while never reusing a nonce for different
/// plaintexts. An empty plaintext is a single empty last segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressCipher;

impl AddressCipher {
    pub fn new() -> Self {
        Self
    }

    /// Decrypts ciphertext produced by this scheme for `addr`.
    pub fn decrypt(&self, addr: &EmailAddr, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < PREFIX_LEN + TAG_LEN {
            return Err(DecryptionError);
        }

        let key = derive_key(addr);
        let cipher = ChaCha20Poly1305::new(&key);

        let (prefix, sealed) = ciphertext.split_at(PREFIX_LEN);
        let prefix: &[u8; PREFIX_LEN] = prefix.try_into().map_err(|_| DecryptionError)?;

        let segments: Vec<_> = sealed.chunks(SEGMENT_SIZE + TAG_LEN).collect();
        let last = segments.len() - 1;

        let mut plaintext = Vec::with_capacity(sealed.len());
        for (i, segment) in segments.into_iter().enumerate() {
            let nonce = segment_nonce(prefix, i, i == last).ok_or(DecryptionError)?;
            let opened = cipher.decrypt(&nonce, segment).map_err(|_| DecryptionError)?;
            plaintext.extend(opened);
        }

        if nonce_prefix(&key, &plaintext) != *prefix {
            return Err(DecryptionError);
        }

        Ok(plaintext)
    }
}

impl Encryption for AddressCipher {
    fn encrypt(&self, addr: &EmailAddr, plaintext: &[u8], out: &mut dyn Write) -> io::Result<()> {
        let key = derive_key(addr);
        let cipher = ChaCha20Poly1305::new(&key);
        let prefix = nonce_prefix(&key, plaintext);

        out.write_all(&prefix)?;

        let count = plaintext.len().div_ceil(SEGMENT_SIZE).max(1);

        for i in 0..count {
            let start = i * SEGMENT_SIZE;
            let end = plaintext.len().min(start + SEGMENT_SIZE);

            let nonce = segment_nonce(&prefix, i, i + 1 == count)
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "too many segments"))?;
            let sealed = cipher
                .encrypt(&nonce, &plaintext[start..end])
                .map_err(|_| io::Error::new(ErrorKind::Other, "segment encryption failed"))?;

            out.write_all(&sealed)?;
        }

        Ok(())
    }
}

fn derive_key(addr: &EmailAddr) -> Key {
    Sha256::new()
        .chain_update(KEY_CONTEXT)
        .chain_update(addr.canonical().as_bytes())
        .finalize()
}

fn nonce_prefix(key: &Key, plaintext: &[u8]) -> [u8; PREFIX_LEN] {
    let hash = Sha256::new()
        .chain_update(key)
        .chain_update(plaintext)
        .finalize();

    let mut prefix = [0; PREFIX_LEN];
    prefix.copy_from_slice(&hash[..PREFIX_LEN]);
    prefix
}

fn segment_nonce(prefix: &[u8; PREFIX_LEN], index: usize, last: bool) -> Option<Nonce> {
    let counter = u32::try_from(index).ok()?;

    let mut nonce = [0; 12];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);

    Some(Nonce::clone_from_slice(&nonce))
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DecryptionError;

impl Display for DecryptionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decrypt evidence")
    }
}

impl Error for DecryptionError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(addr: &str, plaintext: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        AddressCipher::new()
            .encrypt(&EmailAddr::new(addr), plaintext, &mut out)
            .unwrap();
        out
    }

    #[test]
    fn deterministic_per_address_and_message() {
        let a = encrypt("me@example.com", b"hello");
        let b = encrypt("ME@example.com", b"hello");
        let c = encrypt("you@example.com", b"hello");
        let d = encrypt("me@example.com", b"hellp");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a[..PREFIX_LEN], d[..PREFIX_LEN]);
        assert_eq!(a.len(), PREFIX_LEN + 5 + TAG_LEN);
    }

    #[test]
    fn segmented_layout() {
        assert_eq!(encrypt("me@example.com", b"").len(), PREFIX_LEN + TAG_LEN);

        let plaintext = vec![b'x'; 2 * SEGMENT_SIZE + 1];
        let ciphertext = encrypt("me@example.com", &plaintext);
        assert_eq!(ciphertext.len(), PREFIX_LEN + plaintext.len() + 3 * TAG_LEN);

        let plaintext = vec![b'x'; SEGMENT_SIZE];
        let ciphertext = encrypt("me@example.com", &plaintext);
        assert_eq!(ciphertext.len(), PREFIX_LEN + plaintext.len() + TAG_LEN);
    }

    #[test]
    fn decrypt_with_address() {
        let addr = EmailAddr::new("me@example.com");
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let ciphertext = encrypt("me@example.com", &plaintext);

        let cipher = AddressCipher::new();
        assert_eq!(cipher.decrypt(&addr, &ciphertext), Ok(plaintext));

        let other = EmailAddr::new("you@example.com");
        assert_eq!(cipher.decrypt(&other, &ciphertext), Err(DecryptionError));
    }

    #[test]
    fn decrypt_rejects_truncation() {
        let addr = EmailAddr::new("me@example.com");
        let plaintext = vec![b'y'; SEGMENT_SIZE + 10];
        let ciphertext = encrypt("me@example.com", &plaintext);

        let cipher = AddressCipher::new();

        // dropping the final segment leaves a segment not flagged as last
        let truncated = &ciphertext[..PREFIX_LEN + SEGMENT_SIZE + TAG_LEN];
        assert_eq!(cipher.decrypt(&addr, truncated), Err(DecryptionError));

        assert_eq!(cipher.decrypt(&addr, &ciphertext[..3]), Err(DecryptionError));
    }
}
