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

//! A library for proving control of an email address through WebFinger
//! delegation, without running a WebFinger server of one’s own.
//!
//! Mail sent to the service is accepted, and a message carrying a valid DKIM
//! signature is kept as *evidence*. The evidence is encrypted, and the
//! ciphertext is content-addressed by its SHA-1 digest. Later, a WebFinger
//! query for the sender’s address returns a discovery document pointing at
//! the endpoint named in the message body (the *delegation directive*,
//! `webfist = <url>`), together with a *proof token* that binds the answer to
//! the stored ciphertext. Anyone who knows the address can fetch the
//! ciphertext, recompute its digest, and compare.
//!
//! # Usage
//!
//! The ingestion side is [`IngestPipeline`]: it takes the bytes of an accepted
//! message, parses it into an [`Email`], gates it on DKIM verification
//! ([`DkimVerify`]), and stores it ([`Storage`]).
//!
//! The query side is [`ProofLookup`]: it maps a queried address to a
//! [`DiscoveryDocument`] carrying a [`Proof`].
//!
//! Transport (SMTP sessions, HTTP routing) is left to the embedding
//! application.
//!
//! # Logging
//!
//! The library logs through `tracing` and installs no subscriber of its own.

mod addr;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod email;
pub mod header;
pub mod ingest;
pub mod lookup;
pub mod quoted_printable;
pub mod storage;
pub mod verifier;

pub use crate::{
    addr::EmailAddr,
    config::Config,
    crypto::{AddressCipher, Encryption},
    digest::HexDigest,
    email::{Email, EmailError, MAX_EMAIL_SIZE},
    ingest::{Delivery, IngestError, IngestPipeline},
    lookup::{DiscoveryDocument, Link, LookupError, Proof, ProofLookup},
    storage::{DiskStorage, MemoryStorage, Storage, StorageError},
    verifier::{DkimVerify, ExternalVerifier, VerifierUnavailable},
};
