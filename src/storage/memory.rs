use super::{seal, Storage, StorageError};
use crate::{
    addr::EmailAddr,
    crypto::{AddressCipher, Encryption},
    digest::HexDigest,
    email::Email,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};
use tracing::trace;

struct Record {
    email: Email,
    ciphertext: Arc<[u8]>,
}

/// Storage held in memory, for tests and for embedding.
pub struct MemoryStorage {
    cipher: Arc<dyn Encryption>,
    records: RwLock<HashMap<HexDigest, Vec<Record>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_cipher(Arc::new(AddressCipher::new()))
    }

    pub fn with_cipher(cipher: Arc<dyn Encryption>) -> Self {
        Self {
            cipher,
            records: Default::default(),
        }
    }

    fn find<T>(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
        f: impl FnOnce(&Record) -> T,
    ) -> Result<T, StorageError> {
        let records = self.records.read();

        records
            .get(addr_key)
            .and_then(|rs| rs.iter().find(|r| r.email_sha1() == Some(enc_sha1)))
            .map(f)
            .ok_or(StorageError::NotFound)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("addresses", &self.records.read().len())
            .finish_non_exhaustive()
    }
}

impl Record {
    fn email_sha1(&self) -> Option<&HexDigest> {
        self.email.known_enc_sha1()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_email(&self, addr: &EmailAddr, email: &Email) -> Result<(), StorageError> {
        let sealed = seal(email, &self.cipher).await?;

        let mut email = email.clone();
        email.set_enc_sha1(sealed.enc_sha1.clone());

        let mut records = self.records.write();
        let entry = records.entry(addr.key().clone()).or_default();

        if entry.iter().any(|r| r.email_sha1() == Some(&sealed.enc_sha1)) {
            trace!(addr_key = %addr.key(), enc_sha1 = %sealed.enc_sha1, "email already stored");
            return Ok(());
        }

        entry.push(Record {
            email,
            ciphertext: sealed.ciphertext.into(),
        });

        Ok(())
    }

    async fn emails(&self, addr: &EmailAddr) -> Result<Vec<Email>, StorageError> {
        let records = self.records.read();

        Ok(records
            .get(addr.key())
            .map(|rs| rs.iter().map(|r| r.email.clone()).collect())
            .unwrap_or_default())
    }

    async fn stat_encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<u64, StorageError> {
        self.find(addr_key, enc_sha1, |r| r.ciphertext.len() as u64)
    }

    async fn encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<Vec<u8>, StorageError> {
        self.find(addr_key, enc_sha1, |r| r.ciphertext.to_vec())
    }
}
