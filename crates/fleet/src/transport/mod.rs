//! Remote command execution and file transfer.
//!
//! A transport talks to exactly one instance. It never retries and never
//! reconnects; every failure is surfaced so the caller can apply its own
//! policy (a readiness probe wants fast-fail, a dataset upload tolerates
//! long timeouts).

pub mod ssh;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::SshEndpoint;

pub use ssh::{SshTransport, SshTransportFactory};

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The command did not finish within its bound.
    #[error("Remote operation `{operation}` timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The remote side rejected our credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Nothing is listening yet, or the host is unreachable.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The command ran and exited non-zero.
    #[error("Remote command exited with {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    /// A file transfer failed.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// The local client process could not be spawned.
    #[error("Failed to spawn transport client: {0}")]
    Spawn(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the failure is expected on a freshly booted instance.
    ///
    /// Key propagation and sshd startup are asynchronous, so early auth
    /// failures, refused connections, and timeouts all clear up on their own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Auth(_) | Self::Connection(_)
        )
    }

    /// Whether the instance itself looks unhealthy (as opposed to the command).
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Auth(_) | Self::Connection(_) | Self::Transfer(_)
        )
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an error, keeping stdout on success.
    ///
    /// # Errors
    /// Returns [`TransportError::NonZeroExit`] when the command failed.
    pub fn into_result(self) -> Result<String, TransportError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(TransportError::NonZeroExit {
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Options for a file transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Copy directories recursively.
    pub recursive: bool,
    /// Upper bound for the whole transfer.
    pub timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            timeout: Duration::from_secs(600),
        }
    }
}

impl TransferOptions {
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A remote shell and file-transfer session to one instance.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run `command` through the remote shell and capture its output.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError>;

    /// Copy a local file (or directory, when recursive) to the instance.
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        opts: TransferOptions,
    ) -> Result<(), TransportError>;

    /// Copy a remote file (or directory, when recursive) from the instance.
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        opts: TransferOptions,
    ) -> Result<(), TransportError>;
}

/// Opens transports for instances.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, endpoint: &SshEndpoint) -> Arc<dyn RemoteTransport>;
}

/// Quote a value for safe interpolation into a POSIX shell command.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Auth("Permission denied".into()).is_transient());
        assert!(TransportError::Connection("refused".into()).is_transient());
        assert!(!TransportError::NonZeroExit {
            exit_code: 1,
            stderr: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_into_result() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: "ready\n".into(),
            stderr: String::new(),
        };
        assert_eq!(ok.into_result().unwrap(), "ready\n");

        let failed = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "tar: short read\n".into(),
        };
        match failed.into_result() {
            Err(TransportError::NonZeroExit { exit_code, stderr }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "tar: short read");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/workspace/job-1"), "/workspace/job-1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
