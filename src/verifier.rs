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

//! DKIM verification of incoming evidence.

use crate::config::Config;
use async_trait::async_trait;
use bstr::ByteSlice;
use std::{
    env,
    error::Error,
    ffi::OsString,
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
    time::Duration,
};
use tokio::{io::AsyncWriteExt, process::Command, time};
use tracing::{debug, trace, warn};

/// The exact output by which a verifier program reports success.
const SUCCESS_MARKER: &[u8] = b"signature ok";

/// A capability for verifying the DKIM signatures of a message.
///
/// Verification failure of any kind is reported as `false`; implementations
/// must not treat an unverifiable message as an error.
#[async_trait]
pub trait DkimVerify: Send + Sync {
    /// Returns whether the message carries a valid DKIM signature.
    async fn verify(&self, message: &[u8]) -> bool;
}

/// An error reporting that no DKIM verifier program is available.
///
/// Without a verifier no evidence can be accepted, so this is a configuration
/// error to be reported at startup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifierUnavailable {
    pub names: Vec<String>,
}

impl Display for VerifierUnavailable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} not found; install python-dkim (http://hewgill.com/pydkim/)",
            self.names.join(" / ")
        )
    }
}

impl Error for VerifierUnavailable {}

/// A DKIM verifier that runs an external program, such as `dkimverify` from
/// python-dkim.
///
/// The program receives the message on standard input. The signature is
/// considered valid only if the program exits successfully and its output,
/// standard output and standard error together and with surrounding
/// whitespace removed, is exactly `signature ok`.
#[derive(Clone, Debug)]
pub struct ExternalVerifier {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ExternalVerifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            timeout: Config::default().verifier_timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Searches `PATH` for the first of the given program names.
    pub fn locate<I, S>(names: I) -> Result<Self, VerifierUnavailable>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names.into_iter().map(|s| s.as_ref().to_owned()).collect();

        let path = env::var_os("PATH").unwrap_or_default();

        for name in &names {
            if let Some(program) = find_executable(name, &path) {
                debug!(program = %program.display(), "found DKIM verifier");
                return Ok(Self::new(program));
            }
        }

        Err(VerifierUnavailable { names })
    }

    /// Discovers the verifier program configured in `config`.
    ///
    /// The search happens once per process; later calls, from any thread,
    /// reuse the outcome of the first one, including a failure. The timeout is
    /// taken from each caller’s configuration.
    pub fn discover(config: &Config) -> Result<Self, VerifierUnavailable> {
        static DISCOVERED: OnceLock<Result<PathBuf, VerifierUnavailable>> = OnceLock::new();

        let program = DISCOVERED
            .get_or_init(|| Self::locate(&config.verifier_names).map(|v| v.program))
            .clone()?;

        Ok(Self::new(program).with_timeout(config.verifier_timeout))
    }

    async fn run(&self, message: &[u8]) -> io::Result<bool> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::from(ErrorKind::BrokenPipe))?;
        let input = message.to_vec();

        // Feed stdin concurrently, so that a verifier that writes a lot before
        // reading cannot deadlock against us.
        let feeder = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;

        // A verifier may exit without consuming its input; a broken pipe here
        // is not a verdict by itself.
        if let Ok(Err(e)) = feeder.await {
            trace!("verifier did not read full message: {e}");
        }

        let mut combined = output.stdout;
        combined.extend(output.stderr);

        trace!(status = %output.status, output = ?combined.as_bstr(), "verifier finished");

        Ok(output.status.success() && combined.trim() == SUCCESS_MARKER)
    }
}

#[async_trait]
impl DkimVerify for ExternalVerifier {
    async fn verify(&self, message: &[u8]) -> bool {
        match time::timeout(self.timeout, self.run(message)).await {
            Ok(Ok(verified)) => verified,
            Ok(Err(e)) => {
                warn!(program = %self.program.display(), "could not run DKIM verifier: {e}");
                false
            }
            Err(_) => {
                warn!(program = %self.program.display(), "DKIM verifier timed out");
                false
            }
        }
    }
}

fn find_executable(name: &str, path: &std::ffi::OsStr) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }

    env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ExternalVerifier {
        ExternalVerifier::new("sh").with_args(["-c", script])
    }

    const MESSAGE: &[u8] = b"DKIM-Signature: v=1\r\nFrom: me@example.com\r\n\r\nhi\r\n";

    #[tokio::test]
    async fn accepts_exact_marker() {
        assert!(sh("cat >/dev/null; echo 'signature ok'").verify(MESSAGE).await);
        assert!(sh("cat >/dev/null; printf '\\n  signature ok \\n\\n'").verify(MESSAGE).await);
        assert!(sh("cat >/dev/null; echo 'signature ok' >&2").verify(MESSAGE).await);
    }

    #[tokio::test]
    async fn rejects_anything_else() {
        assert!(!sh("cat >/dev/null; echo 'signature ok!'").verify(MESSAGE).await);
        assert!(!sh("cat >/dev/null; echo 'signature OK'").verify(MESSAGE).await);
        assert!(!sh("cat >/dev/null; echo 'signature verification failed'").verify(MESSAGE).await);
        assert!(!sh("cat >/dev/null").verify(MESSAGE).await);
        assert!(
            !sh("cat >/dev/null; echo 'signature ok'; echo 'signature ok'")
                .verify(MESSAGE)
                .await
        );
    }

    #[tokio::test]
    async fn rejects_nonzero_exit() {
        assert!(!sh("cat >/dev/null; echo 'signature ok'; exit 1").verify(MESSAGE).await);
    }

    #[tokio::test]
    async fn receives_message_on_stdin() {
        let verifier = sh("grep -q '^From: me@example.com' && echo 'signature ok'");
        assert!(verifier.verify(MESSAGE).await);

        assert!(!verifier.verify(b"From: you@example.com\r\n\r\n").await);
    }

    #[tokio::test]
    async fn ignores_unread_input() {
        let message = vec![b'a'; 1 << 20];
        assert!(sh("echo 'signature ok'").verify(&message).await);
    }

    #[tokio::test]
    async fn missing_program_is_failure() {
        let verifier = ExternalVerifier::new("/nonexistent/dkimverify");
        assert!(!verifier.verify(MESSAGE).await);
    }

    #[tokio::test]
    async fn timeout_is_failure() {
        let verifier = sh("sleep 10; echo 'signature ok'").with_timeout(Duration::from_millis(200));
        assert!(!verifier.verify(MESSAGE).await);
    }

    #[test]
    fn locate_on_path() {
        let verifier = ExternalVerifier::locate(["no-such-dkim-verifier", "sh"]).unwrap();
        assert!(verifier.program().ends_with("sh"));

        let error = ExternalVerifier::locate(["no-such-dkim-verifier"]).unwrap_err();
        assert_eq!(error.names, ["no-such-dkim-verifier"]);
        assert!(error.to_string().starts_with("no-such-dkim-verifier not found"));
    }

    #[test]
    fn locate_by_path() {
        assert!(ExternalVerifier::locate(["/bin/sh"]).is_ok());
        assert!(ExternalVerifier::locate(["/nonexistent/sh"]).is_err());
    }
}
