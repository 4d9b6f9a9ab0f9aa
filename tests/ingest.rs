pub mod common;

use common::MockVerifier;
use std::sync::Arc;
use webfist::{
    Config, Delivery, EmailAddr, EmailError, IngestError, IngestPipeline, MemoryStorage, Storage,
};

#[tokio::test]
async fn concurrent_deliveries() {
    let _ = tracing_subscriber::fmt::try_init();

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = common::pipeline(MockVerifier::accepting(), storage.clone());

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let from = format!("user{}@example.com", i % 4);
                let body = format!("webfist=http://example.com/{i}");
                pipeline.deliver(common::signed_message(&from, None, &body)).await
            })
        })
        .collect();

    for task in tasks {
        assert!(matches!(task.await.unwrap(), Ok(Delivery::Stored(_))));
    }

    for i in 0..4 {
        let addr = EmailAddr::new(&format!("user{i}@example.com"));
        assert_eq!(storage.emails(&addr).await.unwrap().len(), 4);
    }
}

#[tokio::test]
async fn verifier_sees_raw_message() {
    let _ = tracing_subscriber::fmt::try_init();

    let storage = Arc::new(MemoryStorage::new());
    let verifier = MockVerifier::new(|msg| msg.windows(6).any(|w| w == b"s=sel;"));
    let pipeline = common::pipeline(verifier, storage);

    let msg = common::signed_message("me@example.com", None, "webfist=http://example.com/");
    assert!(matches!(pipeline.deliver(msg).await, Ok(Delivery::Stored(_))));

    let msg = b"DKIM-Signature: v=1; s=other;\r\nFrom: me@example.com\r\n\r\nhi\r\n".to_vec();
    assert!(matches!(pipeline.deliver(msg).await, Ok(Delivery::Discarded)));
}

#[tokio::test]
async fn failures_are_isolated() {
    let _ = tracing_subscriber::fmt::try_init();

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = common::pipeline(MockVerifier::accepting(), storage.clone());

    let oversized = vec![b'x'; webfist::MAX_EMAIL_SIZE + 1];
    assert!(matches!(
        pipeline.deliver(oversized).await,
        Err(IngestError::Email(EmailError::TooLarge))
    ));

    let msg = common::signed_message("not an address", None, "webfist=http://example.com/");
    let error = pipeline.deliver(msg).await.unwrap_err();
    assert!(matches!(error, IngestError::Email(EmailError::BadFromHeader)));
    assert!(std::error::Error::source(&error).is_some());

    let msg = common::signed_message("me@example.com", None, "webfist=http://example.com/");
    assert!(matches!(pipeline.deliver(msg).await, Ok(Delivery::Stored(_))));

    let addr = EmailAddr::new("me@example.com");
    assert_eq!(storage.emails(&addr).await.unwrap().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn external_verifier() {
    use webfist::ExternalVerifier;

    let _ = tracing_subscriber::fmt::try_init();

    let storage = Arc::new(MemoryStorage::new());

    let verifier = ExternalVerifier::new("sh")
        .with_args(["-c", "grep -q '^DKIM-Signature:' && echo 'signature ok'"]);
    let pipeline = IngestPipeline::new(Arc::new(verifier), storage.clone(), &Config::default());

    let msg = common::signed_message("me@example.com", None, "webfist=http://example.com/");
    let delivery = pipeline.deliver(msg).await.unwrap();
    assert_eq!(delivery, Delivery::Stored(EmailAddr::new("me@example.com")));

    let script = "cat >/dev/null; echo 'signature verification failed'";
    let verifier = ExternalVerifier::new("sh").with_args(["-c", script]);
    let pipeline = IngestPipeline::new(Arc::new(verifier), storage, &Config::default());

    let msg = common::signed_message("you@example.com", None, "webfist=http://example.com/");
    assert_eq!(pipeline.deliver(msg).await.unwrap(), Delivery::Discarded);
}
