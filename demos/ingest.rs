use std::{env, process, sync::Arc};
use tokio::io::{self, AsyncReadExt};
use webfist::{AddressCipher, Config, Delivery, DiskStorage, IngestPipeline, ProofLookup};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut args = env::args();

    let root = match (args.next(), args.next(), args.next()) {
        (_, Some(root), None) => root,
        (_, None, _) => env::var("WEBFIST_ROOT").unwrap_or_else(|_| "webfist-data".into()),
        (program, ..) => {
            eprintln!("usage: {} [<storage dir>]", program.as_deref().unwrap_or("ingest"));
            process::exit(1);
        }
    };

    let mut msg = vec![];
    let n = io::stdin().read_to_end(&mut msg).await.unwrap();
    assert!(n > 0, "empty message on stdin");

    let config = Config::default();

    let storage = Arc::new(DiskStorage::open(&root).await.unwrap());

    let pipeline = match IngestPipeline::with_external_verifier(storage.clone(), &config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let addr = match pipeline.deliver(msg).await {
        Ok(Delivery::Stored(addr)) => addr,
        Ok(Delivery::Discarded) => {
            eprintln!("message did not pass DKIM verification");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let lookup = ProofLookup::new(storage, Arc::new(AddressCipher::new()));

    match lookup.lookup(addr.as_str()).await {
        Ok(document) => println!("{}", document.to_json().unwrap()),
        Err(e) => {
            eprintln!("{addr}: {e}");
            process::exit(1);
        }
    }
}
