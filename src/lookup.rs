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

//! Proof-bearing discovery lookups.
//!
//! A lookup for an address answers with the delegation target from the most
//! recent stored evidence, together with a proof URL naming the encrypted
//! evidence. Anybody can fetch the ciphertext by that URL and check that its
//! SHA-1 digest matches; whoever knows the address can decrypt it and check
//! the DKIM signature themselves.

use crate::{
    addr::EmailAddr,
    crypto::Encryption,
    digest::HexDigest,
    storage::{Storage, StorageError},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    str::FromStr,
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Link relation of the delegation link.
pub const REL: &str = "http://webfist.org/spec/rel";

/// Link property holding the proof URL.
pub const PROOF_PROPERTY: &str = "http://webfist.org/spec/proof";

/// Prefix of proof URLs; the proof token follows.
pub const PROOF_URL_PREFIX: &str = "http://webfist.org/webfist/proof/";

/// An error that occurs when answering a lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupError {
    InvalidResource,
    NoEvidence,
    EvidenceUnreadable,
}

impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidResource => write!(f, "invalid resource"),
            // indistinguishable on purpose: a caller must not learn whether
            // evidence exists but could not be read
            Self::NoEvidence | Self::EvidenceUnreadable => write!(f, "not found"),
        }
    }
}

impl Error for LookupError {}

/// A proof token, binding an address key to the digest of one stored
/// encrypted email.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Proof {
    pub addr_key: HexDigest,
    pub enc_sha1: HexDigest,
}

impl Proof {
    pub fn new(addr_key: HexDigest, enc_sha1: HexDigest) -> Self {
        Self { addr_key, enc_sha1 }
    }

    pub fn to_url(&self) -> String {
        format!("{PROOF_URL_PREFIX}{self}")
    }

    /// Checks that `ciphertext` is the encrypted email this proof names.
    pub fn verify(&self, ciphertext: &[u8]) -> bool {
        HexDigest::sha1(ciphertext) == self.enc_sha1
    }
}

impl Display for Proof {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.addr_key, self.enc_sha1)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ParseProofError;

impl Display for ParseProofError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid proof token")
    }
}

impl Error for ParseProofError {}

impl FromStr for Proof {
    type Err = ParseProofError;

    /// Parses a proof URL or a bare proof token.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.strip_prefix(PROOF_URL_PREFIX).unwrap_or(s);

        let (addr_key, enc_sha1) = token.split_once('-').ok_or(ParseProofError)?;

        Ok(Self {
            addr_key: addr_key.parse().map_err(|_| ParseProofError)?,
            enc_sha1: enc_sha1.parse().map_err(|_| ParseProofError)?,
        })
    }
}

/// A WebFinger discovery document (RFC 7033) delegating to another location.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiscoveryDocument {
    pub subject: String,
    pub links: Vec<Link>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
    pub properties: BTreeMap<String, String>,
}

impl DiscoveryDocument {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Answers discovery lookups from stored evidence.
#[derive(Clone)]
pub struct ProofLookup {
    storage: Arc<dyn Storage>,
    cipher: Arc<dyn Encryption>,
}

impl ProofLookup {
    /// Creates a lookup over `storage`. The cipher must be the one evidence
    /// was stored with.
    pub fn new(storage: Arc<dyn Storage>, cipher: Arc<dyn Encryption>) -> Self {
        Self { storage, cipher }
    }

    /// Looks up the delegation for `resource`, an address with or without an
    /// `acct:` or `mailto:` scheme.
    ///
    /// Of all stored emails carrying a delegation directive, the one with the
    /// most recent *Date* wins; emails without a usable date rank below dated
    /// ones, and among equals the first one in storage order wins.
    pub async fn lookup(&self, resource: &str) -> Result<DiscoveryDocument, LookupError> {
        let addr = EmailAddr::new(resource);

        if !addr.is_mailbox() {
            return Err(LookupError::InvalidResource);
        }

        let addr_key = addr.key();

        let emails = self.storage.emails(&addr).await.map_err(|e| {
            warn!(%addr_key, "failed to read evidence: {e}");
            LookupError::EvidenceUnreadable
        })?;

        if emails.is_empty() {
            trace!(%addr_key, "no evidence stored");
            return Err(LookupError::NoEvidence);
        }

        let (_, _, email, target) = emails
            .iter()
            .enumerate()
            .filter_map(|(i, email)| {
                let target = email.webfist().ok()?;
                Some((email.date().ok(), i, email, target))
            })
            .max_by(|(d1, i1, ..), (d2, i2, ..)| d1.cmp(d2).then_with(|| i2.cmp(i1)))
            .ok_or_else(|| {
                debug!(%addr_key, "no evidence with a delegation directive");
                LookupError::NoEvidence
            })?;

        let enc_sha1 = email.enc_sha1(&self.cipher).await.map_err(|e| {
            warn!(%addr_key, "failed to hash evidence: {e}");
            LookupError::EvidenceUnreadable
        })?;

        let proof = Proof::new(addr_key.clone(), enc_sha1);

        debug!(%addr_key, %proof, "answering lookup");

        Ok(DiscoveryDocument {
            subject: addr.as_str().into(),
            links: vec![Link {
                rel: REL.into(),
                href: target,
                properties: BTreeMap::from([(PROOF_PROPERTY.into(), proof.to_url())]),
            }],
        })
    }

    /// Answers a WebFinger query string such as `resource=acct:me@example.com`
    /// with the discovery document as JSON.
    pub async fn webfinger_query(&self, query: &str) -> Result<String, LookupError> {
        let query = query.strip_prefix('?').unwrap_or(query);

        let resource = url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "resource")
            .map(|(_, value)| value.into_owned())
            .ok_or(LookupError::InvalidResource)?;

        let document = self.lookup(&resource).await?;

        document.to_json().map_err(|e| {
            warn!("failed to serialize discovery document: {e}");
            LookupError::EvidenceUnreadable
        })
    }

    /// Fetches the encrypted evidence named by `proof`.
    ///
    /// The ciphertext is only returned if its digest matches the proof.
    pub async fn evidence(&self, proof: &Proof) -> Result<Vec<u8>, StorageError> {
        let size = self
            .storage
            .stat_encrypted_email(&proof.addr_key, &proof.enc_sha1)
            .await?;

        let ciphertext = self
            .storage
            .encrypted_email(&proof.addr_key, &proof.enc_sha1)
            .await?;

        if ciphertext.len() as u64 != size || !proof.verify(&ciphertext) {
            warn!(%proof, "stored evidence does not match its digest");
            return Err(StorageError::ReadFailed(io::Error::new(
                ErrorKind::InvalidData,
                "evidence digest mismatch",
            )));
        }

        Ok(ciphertext)
    }
}
