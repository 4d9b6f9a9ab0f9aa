use crate::digest::HexDigest;
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
};

/// An email address together with its anonymized storage key.
///
/// The key is the SHA-1 digest of the canonical form of the address: leading
/// and trailing whitespace removed, an `acct:` or `mailto:` scheme prefix
/// removed, and the whole address lower-cased. Sub-addresses (`+tag`) and
/// dots in the local part are kept as written, since they name distinct
/// mailboxes at many providers.
///
/// Equality and hashing go by key, so two spellings that differ only in case
/// are the same address.
#[derive(Clone, Debug)]
pub struct EmailAddr {
    raw: Box<str>,
    key: HexDigest,
}

impl EmailAddr {
    pub fn new(addr: &str) -> Self {
        let raw = strip_scheme(addr.trim()).trim();
        let key = HexDigest::sha1(canonicalize(raw));
        Self {
            raw: raw.into(),
            key,
        }
    }

    /// The address as written, without surrounding whitespace or scheme.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The canonical form from which the key is derived.
    pub fn canonical(&self) -> String {
        canonicalize(&self.raw)
    }

    pub fn key(&self) -> &HexDigest {
        &self.key
    }

    /// Whether this looks like a mailbox address (`local@domain`).
    pub fn is_mailbox(&self) -> bool {
        match self.raw.rsplit_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !self.raw.chars().any(|c| c.is_whitespace() || c.is_control())
            }
            None => false,
        }
    }
}

fn strip_scheme(s: &str) -> &str {
    for scheme in ["acct:", "mailto:"] {
        if let Some(prefix) = s.get(..scheme.len()) {
            if prefix.eq_ignore_ascii_case(scheme) {
                return &s[scheme.len()..];
            }
        }
    }
    s
}

fn canonicalize(s: &str) -> String {
    s.to_lowercase()
}

impl PartialEq for EmailAddr {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EmailAddr {}

impl Hash for EmailAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Display for EmailAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sha1_of_canonical_form() {
        let addr = EmailAddr::new("myname@example.com");
        assert_eq!(addr.key().as_str(), "b3d4533a3cf42cca88892c6d461f6dcd8108c99d");
    }

    #[test]
    fn spellings_share_key() {
        let a = EmailAddr::new("MyName@Example.COM");
        let b = EmailAddr::new("  acct:myname@example.com\r\n");
        let c = EmailAddr::new("MAILTO:myname@example.com");
        assert_eq!(a, b);
        assert_eq!(a.key(), c.key());

        assert_eq!(a.as_str(), "MyName@Example.COM");
        assert_eq!(b.as_str(), "myname@example.com");
        assert_eq!(a.canonical(), "myname@example.com");
    }

    #[test]
    fn sub_addresses_are_distinct() {
        assert_ne!(
            EmailAddr::new("me+webfist@example.com"),
            EmailAddr::new("me@example.com")
        );
        assert_ne!(
            EmailAddr::new("m.e@example.com"),
            EmailAddr::new("me@example.com")
        );
    }

    #[test]
    fn mailbox_shape() {
        assert!(EmailAddr::new("me@example.com").is_mailbox());
        assert!(EmailAddr::new("acct:me@example.com").is_mailbox());

        assert!(!EmailAddr::new("example.com").is_mailbox());
        assert!(!EmailAddr::new("@example.com").is_mailbox());
        assert!(!EmailAddr::new("me@").is_mailbox());
        assert!(!EmailAddr::new("m e@example.com").is_mailbox());
    }
}
