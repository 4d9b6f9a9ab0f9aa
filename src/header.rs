//! Representation of email header data.

use bstr::ByteSlice;
use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
};

pub type HeaderField = (FieldName, FieldBody);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderFieldError;

impl Display for HeaderFieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "malformed header field")
    }
}

impl Error for HeaderFieldError {}

/// The header fields of a message, in order of appearance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderFields(Box<[HeaderField]>);

impl HeaderFields {
    pub fn new(value: impl Into<Box<[HeaderField]>>) -> Result<Self, HeaderFieldError> {
        let value = value.into();
        if value.is_empty() {
            return Err(HeaderFieldError);
        }
        Ok(Self(value))
    }

    /// Splits a message into its header fields and its body.
    ///
    /// Both CRLF and bare LF line endings are accepted. Folded continuation
    /// lines are joined to their field with CRLF. The header block ends at the
    /// first empty line; a message that ends inside the header block has an
    /// empty body.
    pub fn parse_message(message: &[u8]) -> Result<(Self, &[u8]), HeaderFieldError> {
        let mut fields: Vec<(FieldName, Vec<u8>)> = vec![];
        let mut rest = message;

        let body = loop {
            if rest.is_empty() {
                break rest;
            }

            let (line, next) = match rest.find_byte(b'\n') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, &rest[rest.len()..]),
            };
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.is_empty() {
                break next;
            }

            if line.starts_with(b" ") || line.starts_with(b"\t") {
                let (_, value) = fields.last_mut().ok_or(HeaderFieldError)?;
                value.extend_from_slice(b"\r\n");
                value.extend_from_slice(line);
            } else {
                let i = line.find_byte(b':').ok_or(HeaderFieldError)?;
                let name = line[..i].to_str().map_err(|_| HeaderFieldError)?;
                let name = FieldName::new(name)?;
                fields.push((name, line[i + 1..].to_vec()));
            }

            rest = next;
        };

        let fields: Vec<_> = fields
            .into_iter()
            .map(|(name, value)| Ok((name, FieldBody::new(value)?)))
            .collect::<Result<_, _>>()?;

        Ok((Self::new(fields)?, body))
    }

    /// Returns the body of the first header field with the given name.
    pub fn get(&self, name: &str) -> Option<&FieldBody> {
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, body)| body)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl AsRef<[HeaderField]> for HeaderFields {
    fn as_ref(&self) -> &[HeaderField] {
        &self.0
    }
}

#[derive(Clone, Eq)]
pub struct FieldName(Box<str>);

impl FieldName {
    pub fn new(value: impl Into<Box<str>>) -> Result<Self, HeaderFieldError> {
        let value = value.into();
        if value.is_empty() {
            return Err(HeaderFieldError);
        }
        if !value.chars().all(|c| c.is_ascii_graphic() && c != ':') {
            return Err(HeaderFieldError);
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for FieldName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Debug for FieldName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl PartialEq for FieldName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl PartialEq<&str> for FieldName {
    fn eq(&self, other: &&str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Hash for FieldName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

#[derive(Clone, Eq, Hash, PartialEq)]
pub struct FieldBody(Box<[u8]>);

impl FieldBody {
    pub fn new(value: impl Into<Box<[u8]>>) -> Result<Self, HeaderFieldError> {
        let value = value.into();
        // only folded continuation lines:
        if !(value
            .split_str("\r\n")
            .skip(1)
            .all(|line| line.starts_with(b" ") || line.starts_with(b"\t")))
        {
            return Err(HeaderFieldError);
        }
        // no empty or blank lines past the first one, no trailing CRLF:
        if !(value
            .split_str("\r\n")
            .skip(1)
            .all(|line| !line.trim_with(|c| matches!(c, ' ' | '\t')).is_empty()))
        {
            return Err(HeaderFieldError);
        }
        // no stray CR and LF
        if !(value.split_str("\r\n").all(|line| !line.contains(&b'\r') && !line.contains(&b'\n'))) {
            return Err(HeaderFieldError);
        }
        // allow all other bytes, UTF-8 not required to accomodate eg mistaken Latin 1 bytes
        Ok(Self(value))
    }

    /// Returns the unfolded value with surrounding whitespace removed.
    ///
    /// Ill-formed UTF-8 is replaced, not rejected.
    pub fn to_unfolded_string(&self) -> String {
        let unfolded = self.0.replace("\r\n", "");
        String::from_utf8_lossy(unfolded.trim()).into_owned()
    }
}

impl AsRef<[u8]> for FieldBody {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for FieldBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FieldBody")
            .field(&self.0.as_bstr())
            .finish()
    }
}
