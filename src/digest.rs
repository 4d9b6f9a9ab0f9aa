//! SHA-1 hex digests, used both as address keys and as content hashes.

use ::digest::Digest;
use sha1::Sha1;
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// Length in characters of a hex-encoded SHA-1 digest.
pub const HEX_DIGEST_LEN: usize = 40;

/// A lowercase hex-encoded SHA-1 digest.
///
/// Values of this type are always exactly 40 lowercase hex digits, which
/// makes them safe to use as file names.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HexDigest(Box<str>);

impl HexDigest {
    /// Computes the SHA-1 digest of the given bytes.
    pub fn sha1(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(bytes.as_ref());
        hasher.finish().0
    }

    fn from_output(output: &[u8]) -> Self {
        debug_assert_eq!(output.len() * 2, HEX_DIGEST_LEN);
        Self(hex::encode(output).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for HexDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HexDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl Display for HexDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DigestError;

impl Display for DigestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "not a hex-encoded SHA-1 digest")
    }
}

impl Error for DigestError {}

impl FromStr for HexDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEX_DIGEST_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError);
        }
        Ok(Self(s.to_ascii_lowercase().into()))
    }
}

/// An incremental SHA-1 hasher that also counts the bytes it consumed.
pub struct ContentHasher {
    digest: Sha1,
    bytes_written: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            digest: Sha1::new(),
            bytes_written: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.bytes_written += bytes.len() as u64;
    }

    /// Returns the digest and the number of bytes hashed.
    pub fn finish(self) -> (HexDigest, u64) {
        let output = self.digest.finalize();
        (HexDigest::from_output(&output), self.bytes_written)
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}
