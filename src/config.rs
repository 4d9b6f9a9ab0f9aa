//! Service configuration.

use crate::email::MAX_EMAIL_SIZE;
use std::time::Duration;

/// Configuration for the ingestion side and for verifier discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Messages larger than this many bytes are rejected before parsing.
    /// Values above [`MAX_EMAIL_SIZE`] are lowered to it, since stored
    /// evidence is always read back with that limit in place.
    pub max_email_size: usize,

    /// Program names searched for in `PATH` when discovering the external
    /// DKIM verifier, in order of preference.
    pub verifier_names: Vec<String>,

    /// The maximum duration of one external verifier run. When this duration
    /// is exceeded the verifier is killed and the message counts as not
    /// verified.
    pub verifier_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_email_size: MAX_EMAIL_SIZE,
            verifier_names: vec!["dkimverify.py".into(), "dkimverify".into()],
            verifier_timeout: Duration::from_secs(10),
        }
    }
}
