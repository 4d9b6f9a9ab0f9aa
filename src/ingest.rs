//! Ingestion of incoming mail.

use crate::{
    addr::EmailAddr,
    config::Config,
    email::{Email, EmailError, MAX_EMAIL_SIZE},
    storage::{Storage, StorageError},
    verifier::{DkimVerify, ExternalVerifier, VerifierUnavailable},
};
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// The outcome of delivering one message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// The message was verified and stored as evidence for the address.
    Stored(EmailAddr),
    /// The message failed DKIM verification and was dropped.
    Discarded,
}

/// An error that occurs when ingesting a message.
#[derive(Debug)]
pub enum IngestError {
    Email(EmailError),
    Storage(StorageError),
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email(error) => Display::fmt(error, f),
            Self::Storage(error) => Display::fmt(error, f),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Email(error) => Some(error),
            Self::Storage(error) => Some(error),
        }
    }
}

impl From<EmailError> for IngestError {
    fn from(error: EmailError) -> Self {
        Self::Email(error)
    }
}

impl From<StorageError> for IngestError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error)
    }
}

/// Turns incoming messages into stored evidence.
///
/// Each delivery is independent; a pipeline can be shared between any number
/// of concurrent deliveries.
#[derive(Clone)]
pub struct IngestPipeline {
    verifier: Arc<dyn DkimVerify>,
    storage: Arc<dyn Storage>,
    max_email_size: usize,
}

impl IngestPipeline {
    /// Creates a pipeline.
    ///
    /// A configured size limit above [`MAX_EMAIL_SIZE`] is lowered to it:
    /// stored evidence is read back with that limit, and larger messages
    /// could be stored but never found again.
    pub fn new(verifier: Arc<dyn DkimVerify>, storage: Arc<dyn Storage>, config: &Config) -> Self {
        let mut max_email_size = config.max_email_size;

        if max_email_size > MAX_EMAIL_SIZE {
            warn!(max_email_size, "email size limit lowered to {MAX_EMAIL_SIZE}");
            max_email_size = MAX_EMAIL_SIZE;
        }

        Self {
            verifier,
            storage,
            max_email_size,
        }
    }

    /// Creates a pipeline verifying with the external verifier program found
    /// on this system.
    pub fn with_external_verifier(
        storage: Arc<dyn Storage>,
        config: &Config,
    ) -> Result<Self, VerifierUnavailable> {
        let verifier = ExternalVerifier::discover(config)?;
        Ok(Self::new(Arc::new(verifier), storage, config))
    }

    /// Delivers one raw message.
    ///
    /// Messages that fail DKIM verification are discarded without error.
    pub async fn deliver(&self, raw: Vec<u8>) -> Result<Delivery, IngestError> {
        let email = Email::with_max_size(raw, self.max_email_size).map_err(|e| {
            debug!("rejecting message: {e}");
            e
        })?;

        if !email.verify(self.verifier.as_ref()).await {
            debug!("discarding message that failed DKIM verification");
            return Ok(Delivery::Discarded);
        }

        let addr = email.from()?;
        let addr_key = addr.key();

        self.storage.put_email(&addr, &email).await.map_err(|e| {
            warn!(%addr_key, "failed to store evidence: {e}");
            e
        })?;

        info!(%addr_key, "stored evidence");

        Ok(Delivery::Stored(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    struct Fixed(bool);

    #[async_trait]
    impl DkimVerify for Fixed {
        async fn verify(&self, _: &[u8]) -> bool {
            self.0
        }
    }

    const SIGNED: &[u8] = b"DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=sel\r\n\
From: Me <me@example.com>\r\n\
Subject: webfist\r\n\
\r\n\
webfist=http://example.com/me.json\r\n";

    fn pipeline(verified: bool) -> (IngestPipeline, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let config = Config::default();
        let pipeline = IngestPipeline::new(Arc::new(Fixed(verified)), storage.clone(), &config);
        (pipeline, storage)
    }

    #[tokio::test]
    async fn store_verified() {
        let (pipeline, storage) = pipeline(true);

        let delivery = pipeline.deliver(SIGNED.to_vec()).await.unwrap();

        let addr = EmailAddr::new("me@example.com");
        assert_eq!(delivery, Delivery::Stored(addr.clone()));
        assert_eq!(storage.emails(&addr).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discard_unverified() {
        let (pipeline, storage) = pipeline(false);

        let delivery = pipeline.deliver(SIGNED.to_vec()).await.unwrap();

        assert_eq!(delivery, Delivery::Discarded);
        assert!(storage.emails(&EmailAddr::new("me@example.com")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discard_unsigned_without_verifying() {
        let (pipeline, _) = pipeline(true);

        let delivery = pipeline
            .deliver(b"From: me@example.com\r\n\r\nwebfist=http://example.com/\r\n".to_vec())
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Discarded);
    }

    #[tokio::test]
    async fn reject_oversized() {
        let storage = Arc::new(MemoryStorage::new());
        let config = Config {
            max_email_size: 100,
            ..Default::default()
        };
        let pipeline = IngestPipeline::new(Arc::new(Fixed(true)), storage, &config);

        let result = pipeline.deliver(SIGNED.repeat(2)).await;

        assert!(matches!(result, Err(IngestError::Email(EmailError::TooLarge))));
    }

    #[tokio::test]
    async fn size_limit_capped_at_readable_size() {
        let storage = Arc::new(MemoryStorage::new());
        let config = Config {
            max_email_size: 128 << 10,
            ..Default::default()
        };
        let pipeline = IngestPipeline::new(Arc::new(Fixed(true)), storage, &config);

        let mut msg = SIGNED.to_vec();
        msg.resize(70 << 10, b'a');

        let result = pipeline.deliver(msg).await;

        assert!(matches!(result, Err(IngestError::Email(EmailError::TooLarge))));

        let mut msg = SIGNED.to_vec();
        msg.resize(MAX_EMAIL_SIZE, b'a');

        assert!(matches!(pipeline.deliver(msg).await, Ok(Delivery::Stored(_))));
    }

    #[tokio::test]
    async fn reject_bad_sender() {
        let (pipeline, _) = pipeline(true);

        let msg = b"DKIM-Signature: v=1\r\nFrom: a@example.com, b@example.com\r\n\r\nhi\r\n";
        let result = pipeline.deliver(msg.to_vec()).await;

        assert!(matches!(result, Err(IngestError::Email(EmailError::BadFromHeader))));

        let result = pipeline.deliver(b"not an email".to_vec()).await;

        assert!(matches!(result, Err(IngestError::Email(EmailError::MalformedEnvelope))));
    }
}
