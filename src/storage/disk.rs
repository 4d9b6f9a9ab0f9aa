use super::{seal, Storage, StorageError};
use crate::{
    addr::EmailAddr,
    crypto::{AddressCipher, Encryption},
    digest::HexDigest,
    email::Email,
};
use async_trait::async_trait;
use std::{
    fmt::{self, Debug, Formatter},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;
use tokio::{fs, task};
use tracing::{debug, trace, warn};

const RAW_DIR: &str = "raw";
const ENC_DIR: &str = "enc";
const RAW_EXT: &str = "eml";
const ENC_EXT: &str = "enc";

/// Storage in a directory tree.
///
/// Layout below the root directory:
///
/// ```text
/// raw/<address key>/<content hash>.eml
/// enc/<address key>/<content hash>.enc
/// ```
///
/// Address keys and content hashes are hex digests, so they never escape
/// their directory. Files are written to a temporary file next to their
/// destination and then renamed into place, so readers never observe partial
/// files. The encrypted file is written first: a raw file is only ever
/// present together with its encrypted counterpart.
pub struct DiskStorage {
    root: PathBuf,
    cipher: Arc<dyn Encryption>,
}

impl DiskStorage {
    /// Opens storage rooted at `root`, creating the directory if necessary.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        Self::open_with_cipher(root, Arc::new(AddressCipher::new())).await
    }

    pub async fn open_with_cipher(
        root: impl Into<PathBuf>,
        cipher: Arc<dyn Encryption>,
    ) -> io::Result<Self> {
        let root = root.into();

        fs::create_dir_all(root.join(RAW_DIR)).await?;
        fs::create_dir_all(root.join(ENC_DIR)).await?;

        Ok(Self { root, cipher })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn raw_dir(&self, addr_key: &HexDigest) -> PathBuf {
        self.root.join(RAW_DIR).join(addr_key.as_str())
    }

    fn enc_dir(&self, addr_key: &HexDigest) -> PathBuf {
        self.root.join(ENC_DIR).join(addr_key.as_str())
    }

    fn enc_path(&self, addr_key: &HexDigest, enc_sha1: &HexDigest) -> PathBuf {
        self.enc_dir(addr_key).join(file_name(enc_sha1, ENC_EXT))
    }
}

impl Debug for DiskStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStorage")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn put_email(&self, addr: &EmailAddr, email: &Email) -> Result<(), StorageError> {
        let sealed = seal(email, &self.cipher).await?;

        let addr_key = addr.key();
        let raw_dir = self.raw_dir(addr_key);
        let raw_path = raw_dir.join(file_name(&sealed.enc_sha1, RAW_EXT));

        if fs::try_exists(&raw_path).await.map_err(StorageError::WriteFailed)? {
            trace!(%addr_key, enc_sha1 = %sealed.enc_sha1, "email already stored");
            return Ok(());
        }

        let enc_dir = self.enc_dir(addr_key);
        let enc_path = enc_dir.join(file_name(&sealed.enc_sha1, ENC_EXT));

        write_atomically(enc_dir, enc_path, sealed.ciphertext).await?;
        write_atomically(raw_dir, raw_path, email.raw().to_vec()).await?;

        debug!(%addr_key, enc_sha1 = %sealed.enc_sha1, "stored email");

        Ok(())
    }

    async fn emails(&self, addr: &EmailAddr) -> Result<Vec<Email>, StorageError> {
        let dir = self.raw_dir(addr.key());

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StorageError::ReadFailed(e)),
        };

        let mut files = vec![];

        while let Some(entry) = entries.next_entry().await.map_err(StorageError::ReadFailed)? {
            let path = entry.path();

            let Some(enc_sha1) = stored_digest(&path, RAW_EXT) else {
                trace!(path = %path.display(), "skipping foreign file");
                continue;
            };

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map_err(StorageError::ReadFailed)?;

            files.push((modified, enc_sha1, path));
        }

        files.sort_by(|(t1, h1, _), (t2, h2, _)| t1.cmp(t2).then_with(|| h1.cmp(h2)));

        let mut emails = Vec::with_capacity(files.len());

        for (_, enc_sha1, path) in files {
            let raw = fs::read(&path).await.map_err(StorageError::ReadFailed)?;

            match Email::new(raw) {
                Ok(mut email) => {
                    email.set_enc_sha1(enc_sha1);
                    emails.push(email);
                }
                Err(e) => {
                    warn!(path = %path.display(), "ignoring unreadable stored email: {e}");
                }
            }
        }

        Ok(emails)
    }

    async fn stat_encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<u64, StorageError> {
        let path = self.enc_path(addr_key, enc_sha1);

        match fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(m.len()),
            Ok(_) => Err(StorageError::NotFound),
            Err(e) => Err(read_error(e)),
        }
    }

    async fn encrypted_email(
        &self,
        addr_key: &HexDigest,
        enc_sha1: &HexDigest,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.enc_path(addr_key, enc_sha1);

        fs::read(&path).await.map_err(read_error)
    }
}

fn file_name(digest: &HexDigest, ext: &str) -> String {
    format!("{digest}.{ext}")
}

// The content hash a stored file is named after, if it is one of ours.
fn stored_digest(path: &Path, ext: &str) -> Option<HexDigest> {
    if path.extension()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_error(e: io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        StorageError::ReadFailed(e)
    }
}

async fn write_atomically(
    dir: PathBuf,
    path: PathBuf,
    contents: Vec<u8>,
) -> Result<(), StorageError> {
    fs::create_dir_all(&dir).await.map_err(StorageError::WriteFailed)?;

    task::spawn_blocking(move || {
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(&contents)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok::<_, io::Error>(())
    })
    .await
    .map_err(|e| StorageError::WriteFailed(io::Error::new(ErrorKind::Other, e)))?
    .map_err(StorageError::WriteFailed)
}
