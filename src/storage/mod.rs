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

//! Persistence of evidence.
//!
//! Evidence is kept per address key in two forms: the raw message, which is
//! internal, and the encrypted message, which anybody holding a proof token
//! may fetch. Both are indexed by the SHA-1 digest of the encrypted message.

mod disk;
mod memory;

pub use self::{disk::DiskStorage, memory::MemoryStorage};

use crate::{
    addr::EmailAddr,
    crypto::Encryption,
    digest::HexDigest,
    email::{Email, EmailError, Sealed},
};
use async_trait::async_trait;
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    sync::Arc,
};

/// An error that occurs when storing or retrieving evidence.
#[derive(Debug)]
pub enum StorageError {
    WriteFailed(io::Error),
    ReadFailed(io::Error),
    NotFound,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed(error) => write!(f, "failed to store evidence: {error}"),
            Self::ReadFailed(error) => write!(f, "failed to read evidence: {error}"),
            Self::NotFound => write!(f, "evidence not found"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::WriteFailed(error) | Self::ReadFailed(error) => Some(error),
            Self::NotFound => None,
        }
    }
}

/// A store of verified emails.
///
/// Implementations must be safe to use from many tasks at once; storing
/// emails for different addresses concurrently must not interfere. Storing
/// the same email twice is idempotent.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `email` as evidence for `addr`, both raw and encrypted.
    async fn put_email(&self, addr: &EmailAddr, email: &Email) -> Result<(), StorageError>;

    /// Returns all emails stored for `addr`, in a stable order.
    ///
    /// The returned emails already know the digest of their encrypted form.
    async fn emails(&self, addr: &EmailAddr) -> Result<Vec<Email>, StorageError>;

    /// Returns the size in bytes of a stored encrypted email.
    async fn stat_encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<u64, StorageError>;

    /// Returns the contents of a stored encrypted email.
    async fn encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<Vec<u8>, StorageError>;
}

// Encrypts `email` for storage, mapping failure to a write error.
async fn seal(email: &Email, cipher: &Arc<dyn Encryption>) -> Result<Sealed, StorageError> {
    email.sealed(cipher).await.map_err(|e| match e {
        EmailError::Encryption(error) => StorageError::WriteFailed(error),
        e => StorageError::WriteFailed(io::Error::new(ErrorKind::InvalidInput, e)),
    })
}
