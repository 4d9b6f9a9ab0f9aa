use async_trait::async_trait;
use std::sync::Arc;
use webfist::{Config, DkimVerify, IngestPipeline, Storage};

#[derive(Clone)]
pub struct MockVerifier(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>);

impl MockVerifier {
    pub fn new(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn accepting() -> Self {
        Self::new(|_| true)
    }
}

#[async_trait]
impl DkimVerify for MockVerifier {
    async fn verify(&self, message: &[u8]) -> bool {
        self.0(message)
    }
}

pub fn pipeline(verifier: MockVerifier, storage: Arc<dyn Storage>) -> IngestPipeline {
    IngestPipeline::new(Arc::new(verifier), storage, &Config::default())
}

/// Composes a message that looks DKIM-signed to the pipeline.
pub fn signed_message(from: &str, date: Option<&str>, body: &str) -> Vec<u8> {
    let mut msg = String::new();
    msg.push_str(
        "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/simple; d=example.com; s=sel;\r\n\
         \th=From:Date:Subject; bh=frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY=;\r\n\
         \tb=dzdVyOfAKCdLXdJOc9G2q8LoXSlEniSbav+yuU4zGeeruD00lszZVoG4ZHRNiYzR\r\n",
    );
    msg.push_str(&format!("From: {from}\r\n"));
    if let Some(date) = date {
        msg.push_str(&format!("Date: {date}\r\n"));
    }
    msg.push_str("Subject: webfist\r\n\r\n");
    msg.push_str(body);
    msg.push_str("\r\n");
    msg.into_bytes()
}
