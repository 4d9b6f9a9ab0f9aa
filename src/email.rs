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

//! Email messages as evidence.

use crate::{
    addr::EmailAddr,
    crypto::Encryption,
    digest::{ContentHasher, HexDigest},
    header::{FieldBody, HeaderFields},
    quoted_printable,
    verifier::DkimVerify,
};
use chrono::{DateTime, Utc};
use mailparse::MailAddr;
use regex::bytes::Regex;
use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    io::{self, ErrorKind, Write},
    mem,
    pin::Pin,
    sync::{Arc, LazyLock},
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::{mpsc, OnceCell},
    task,
};
use tracing::trace;

/// The maximum size of an RFC 5322 message, including both its header and
/// body.
pub const MAX_EMAIL_SIZE: usize = 64 << 10;

// Ciphertext travels from the encrypting task to the reader in chunks of this
// size, with at most this many chunks in flight.
const CHUNK_SIZE: usize = 8 << 10;
const CHANNEL_CAPACITY: usize = 4;

// webfist=http://example.com/myjrd.json
static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)\bwebfist\s*=\s*(\S+)").expect("invalid delegation directive pattern")
});

/// An error that occurs when handling an email message.
#[derive(Debug)]
pub enum EmailError {
    TooLarge,
    MalformedEnvelope,
    BadFromHeader,
    BadDateHeader,
    NoDelegationDirective,
    Encryption(io::Error),
}

impl Display for EmailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge => write!(f, "email too large"),
            Self::MalformedEnvelope => write!(f, "malformed email"),
            Self::BadFromHeader => write!(f, "missing or invalid From header"),
            Self::BadDateHeader => write!(f, "missing or invalid Date header"),
            Self::NoDelegationDirective => write!(f, "'webfist' assignment missing"),
            Self::Encryption(error) => write!(f, "failed to encrypt email: {error}"),
        }
    }
}

impl Error for EmailError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Encryption(error) => Some(error),
            _ => None,
        }
    }
}

/// A parsed email message.
///
/// Size and format are checked on construction, but no signature
/// verification is done; see [`Email::verify`].
///
/// The header and body are parsed once and never change. The SHA-1 digest of
/// the encrypted message is computed at most once per instance, or seeded by
/// whoever restores the message from storage.
#[derive(Clone)]
pub struct Email {
    raw: Arc<[u8]>,
    headers: HeaderFields,
    body_start: usize,
    enc_sha1: OnceCell<HexDigest>,
}

impl Email {
    /// Parses `raw` as an email, rejecting messages above [`MAX_EMAIL_SIZE`].
    pub fn new(raw: Vec<u8>) -> Result<Self, EmailError> {
        Self::with_max_size(raw, MAX_EMAIL_SIZE)
    }

    /// Parses `raw` as an email, rejecting messages above `max_size` bytes.
    pub fn with_max_size(raw: Vec<u8>, max_size: usize) -> Result<Self, EmailError> {
        if raw.len() > max_size {
            return Err(EmailError::TooLarge);
        }

        let (headers, body) =
            HeaderFields::parse_message(&raw).map_err(|_| EmailError::MalformedEnvelope)?;
        let body_start = raw.len() - body.len();

        Ok(Self {
            raw: raw.into(),
            headers,
            body_start,
            enc_sha1: OnceCell::new(),
        })
    }

    /// The complete message as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn headers(&self) -> &HeaderFields {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_start..]
    }

    pub fn has_dkim_signature(&self) -> bool {
        self.headers.contains("DKIM-Signature")
    }

    /// Returns whether the message carries a DKIM signature that `verifier`
    /// accepts.
    ///
    /// A message without a *DKIM-Signature* header is not verified, and the
    /// verifier is not consulted.
    pub async fn verify<V>(&self, verifier: &V) -> bool
    where
        V: DkimVerify + ?Sized,
    {
        if !self.has_dkim_signature() {
            trace!("no DKIM-Signature header, not verifying");
            return false;
        }
        verifier.verify(&self.raw).await
    }

    /// Returns the single mailbox address in the *From* header.
    pub fn from(&self) -> Result<EmailAddr, EmailError> {
        let value = self.header_value("From").ok_or(EmailError::BadFromHeader)?;

        let addrs = mailparse::addrparse(&value).map_err(|_| EmailError::BadFromHeader)?;

        let addr = match &addrs[..] {
            [MailAddr::Single(info)] => EmailAddr::new(&info.addr),
            _ => return Err(EmailError::BadFromHeader),
        };

        if !addr.is_mailbox() {
            return Err(EmailError::BadFromHeader);
        }

        Ok(addr)
    }

    /// Returns the time in the *Date* header.
    pub fn date(&self) -> Result<DateTime<Utc>, EmailError> {
        let value = self.header_value("Date").ok_or(EmailError::BadDateHeader)?;

        let timestamp = mailparse::dateparse(&value).map_err(|_| EmailError::BadDateHeader)?;

        DateTime::from_timestamp(timestamp, 0).ok_or(EmailError::BadDateHeader)
    }

    /// Returns the delegation target named in the message body.
    ///
    /// The body must contain an assignment naming where the delegated
    /// WebFinger document lives:
    ///
    /// ```text
    /// webfist = http://example.com/my-profile.json
    /// ```
    ///
    /// When there are several, the first one wins. The value is returned as
    /// written in the body. For a message with *Content-Transfer-Encoding:
    /// quoted-printable* the decoded body is searched first.
    pub fn webfist(&self) -> Result<String, EmailError> {
        let body = self.body();

        if self.is_quoted_printable() {
            if let Some(target) = find_directive(&quoted_printable::decode_body(body)) {
                return Ok(target);
            }
        }

        find_directive(body).ok_or(EmailError::NoDelegationDirective)
    }

    fn is_quoted_printable(&self) -> bool {
        self.header_value("Content-Transfer-Encoding")
            .is_some_and(|cte| cte.eq_ignore_ascii_case("quoted-printable"))
    }

    /// Returns a reader over the encrypted message.
    ///
    /// The message is encrypted for its *From* address on the blocking thread
    /// pool while the returned reader is consumed; only a few chunks of
    /// ciphertext are buffered in between. A failure while encrypting surfaces
    /// as a read error.
    pub async fn encrypted(
        &self,
        cipher: &Arc<dyn Encryption>,
    ) -> Result<EncryptedReader, EmailError> {
        let addr = self.from()?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let raw = self.raw.clone();
        let cipher = cipher.clone();

        task::spawn_blocking(move || {
            let mut writer = ChannelWriter::new(tx.clone());

            let result = cipher.encrypt(&addr, &raw, &mut writer).and_then(|_| writer.flush());

            let frame = match result {
                Ok(()) => Frame::Done,
                Err(e) if e.kind() == ErrorKind::BrokenPipe && tx.is_closed() => {
                    trace!("reader went away, encryption abandoned");
                    return;
                }
                Err(e) => Frame::Failed(e),
            };

            // the reader may be gone already
            let _ = tx.blocking_send(frame);
        });

        Ok(EncryptedReader::new(rx))
    }

    /// Returns the lowercase hex SHA-1 digest of the encrypted message.
    ///
    /// The digest is computed on first use and remembered; concurrent callers
    /// share one computation.
    pub async fn enc_sha1(&self, cipher: &Arc<dyn Encryption>) -> Result<HexDigest, EmailError> {
        let digest = self
            .enc_sha1
            .get_or_try_init(|| async {
                let mut reader = self.encrypted(cipher).await?;
                let mut hasher = ContentHasher::new();
                copy_to(&mut reader, |chunk| hasher.update(chunk)).await?;
                Ok::<_, EmailError>(hasher.finish().0)
            })
            .await?;

        Ok(digest.clone())
    }

    /// Sets the digest of the encrypted message, for instance when restoring
    /// a message from storage where the digest is already known.
    ///
    /// A seeded digest takes precedence over any computed one; afterwards
    /// [`Email::enc_sha1`] does no encryption work.
    pub fn set_enc_sha1(&mut self, digest: HexDigest) {
        self.enc_sha1 = OnceCell::new_with(Some(digest));
    }

    /// Returns the digest of the encrypted message if it has been computed or
    /// seeded already.
    pub fn known_enc_sha1(&self) -> Option<&HexDigest> {
        self.enc_sha1.get()
    }

    /// Encrypts the message and returns the ciphertext together with its
    /// digest, remembering the digest if none is known yet.
    pub async fn sealed(&self, cipher: &Arc<dyn Encryption>) -> Result<Sealed, EmailError> {
        let mut reader = self.encrypted(cipher).await?;
        let mut hasher = ContentHasher::new();
        let mut ciphertext = Vec::with_capacity(self.raw.len() + self.raw.len() / 64 + 64);

        copy_to(&mut reader, |chunk| {
            hasher.update(chunk);
            ciphertext.extend_from_slice(chunk);
        })
        .await?;

        let (enc_sha1, _) = hasher.finish();

        // an already seeded or computed digest stays in place
        let _ = self.enc_sha1.set(enc_sha1.clone());

        Ok(Sealed {
            ciphertext,
            enc_sha1,
        })
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.headers.get(name).map(FieldBody::to_unfolded_string)
    }
}

impl Debug for Email {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Email")
            .field("len", &self.raw.len())
            .field("headers", &self.headers)
            .field("enc_sha1", &self.enc_sha1.get())
            .finish()
    }
}

/// An encrypted message and the digest it is stored under.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub enc_sha1: HexDigest,
}

fn find_directive(body: &[u8]) -> Option<String> {
    DIRECTIVE.captures_iter(body).find_map(|caps| {
        let value = caps.get(1)?;
        std::str::from_utf8(value.as_bytes()).ok().map(String::from)
    })
}

async fn copy_to<R, F>(reader: &mut R, mut f: F) -> Result<(), EmailError>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(EmailError::Encryption)?;
        if n == 0 {
            return Ok(());
        }
        f(&buf[..n]);
    }
}

enum Frame {
    Chunk(Vec<u8>),
    Done,
    Failed(io::Error),
}

// The producer end: a blocking writer that hands ciphertext to the channel.
struct ChannelWriter {
    tx: mpsc::Sender<Frame>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
            self.tx
                .blocking_send(Frame::Chunk(chunk))
                .map_err(|_| io::Error::from(ErrorKind::BrokenPipe))?;
        }
        Ok(())
    }
}

/// The consumer end of [`Email::encrypted`].
///
/// The stream ends cleanly only after the encrypting task has finished
/// successfully. If that task fails, or goes away without finishing, reading
/// returns an error instead of a truncated stream.
pub struct EncryptedReader {
    rx: mpsc::Receiver<Frame>,
    chunk: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl EncryptedReader {
    fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            rx,
            chunk: vec![],
            pos: 0,
            finished: false,
        }
    }
}

impl AsyncRead for EncryptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.remaining().min(self.chunk.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.chunk[start..start + n]);
                self.pos += n;
                return Poll::Ready(Ok(()));
            }

            if self.finished {
                return Poll::Ready(Ok(()));
            }

            match ready!(self.rx.poll_recv(cx)) {
                Some(Frame::Chunk(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Some(Frame::Done) => {
                    self.finished = true;
                }
                Some(Frame::Failed(error)) => {
                    self.finished = true;
                    return Poll::Ready(Err(error));
                }
                None => {
                    self.finished = true;
                    return Poll::Ready(Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "encryption ended prematurely",
                    )));
                }
            }
        }
    }
}
