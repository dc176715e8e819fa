//! OpenSSH-backed transport.
//!
//! Shells out to the system `ssh` and `scp` clients, one process per
//! operation. Host keys are not pinned: spot instances come and go and
//! reuse proxy ports, so a known-hosts file would only accumulate conflicts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, RemoteTransport, TransferOptions, TransportError, TransportFactory};
use crate::models::SshEndpoint;

/// Exit status OpenSSH uses for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Default TCP connect timeout handed to `ssh -o ConnectTimeout`.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Transport to a single instance over OpenSSH.
#[derive(Debug, Clone)]
pub struct SshTransport {
    endpoint: SshEndpoint,
    key_path: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(endpoint: SshEndpoint, key_path: Option<PathBuf>) -> Self {
        Self {
            endpoint,
            key_path,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.endpoint.user, self.endpoint.host)
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.endpoint.port.to_string());
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, recursive: bool, source: String, target: String) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-P".to_string());
        args.push(self.endpoint.port.to_string());
        if recursive {
            args.push("-r".to_string());
        }
        args.push(source);
        args.push(target);
        args
    }

    async fn run(
        program: &str,
        args: &[String],
        timeout: Duration,
        operation: &str,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Classify an OpenSSH client failure from its stderr.
fn classify_client_error(stderr: &str) -> TransportError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("permission denied") || lower.contains("authentication failed") {
        TransportError::Auth(message)
    } else {
        TransportError::Connection(message)
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
        debug!(endpoint = %self.endpoint, command, "ssh exec");
        let output = Self::run("ssh", &self.ssh_args(command), timeout, command).await?;

        if output.exit_code == SSH_ERROR_EXIT {
            return Err(classify_client_error(&output.stderr));
        }
        Ok(output)
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        opts: TransferOptions,
    ) -> Result<(), TransportError> {
        debug!(endpoint = %self.endpoint, local = %local.display(), remote, "scp upload");
        let args = self.scp_args(
            opts.recursive,
            local.display().to_string(),
            format!("{}:{remote}", self.destination()),
        );
        let output = Self::run("scp", &args, opts.timeout, "upload").await?;
        check_transfer(&output)
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        opts: TransferOptions,
    ) -> Result<(), TransportError> {
        debug!(endpoint = %self.endpoint, remote, local = %local.display(), "scp download");
        let args = self.scp_args(
            opts.recursive,
            format!("{}:{remote}", self.destination()),
            local.display().to_string(),
        );
        let output = Self::run("scp", &args, opts.timeout, "download").await?;
        check_transfer(&output)
    }
}

fn check_transfer(output: &CommandOutput) -> Result<(), TransportError> {
    if output.success() {
        return Ok(());
    }
    let lower = output.stderr.to_ascii_lowercase();
    if lower.contains("permission denied (publickey")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("no route to host")
    {
        return Err(classify_client_error(&output.stderr));
    }
    Err(TransportError::Transfer(output.stderr.trim().to_string()))
}

/// Opens [`SshTransport`]s with a shared private key.
#[derive(Debug, Clone)]
pub struct SshTransportFactory {
    key_path: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshTransportFactory {
    pub fn new(key_path: Option<PathBuf>) -> Self {
        Self {
            key_path,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl TransportFactory for SshTransportFactory {
    fn connect(&self, endpoint: &SshEndpoint) -> Arc<dyn RemoteTransport> {
        Arc::new(
            SshTransport::new(endpoint.clone(), self.key_path.clone())
                .with_connect_timeout(self.connect_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SshTransport {
        SshTransport::new(
            SshEndpoint::new("ssh5.vast.ai", 31077),
            Some(PathBuf::from("/keys/fleet")),
        )
    }

    #[test]
    fn test_ssh_args_target_endpoint() {
        let args = transport().ssh_args("echo ready");
        let joined = args.join(" ");
        assert!(joined.contains("-p 31077"));
        assert!(joined.contains("-i /keys/fleet"));
        assert!(joined.contains("BatchMode=yes"));
        assert_eq!(args[args.len() - 2], "root@ssh5.vast.ai");
        assert_eq!(args[args.len() - 1], "echo ready");
    }

    #[test]
    fn test_scp_args_recursive_uses_capital_p() {
        let args = transport().scp_args(true, "/tmp/out".into(), "root@h:/w".into());
        let joined = args.join(" ");
        assert!(joined.contains("-P 31077"));
        assert!(args.contains(&"-r".to_string()));
        assert_eq!(args.last().unwrap(), "root@h:/w");
    }

    #[test]
    fn test_classify_client_error() {
        assert!(matches!(
            classify_client_error("root@1.2.3.4: Permission denied (publickey)."),
            TransportError::Auth(_)
        ));
        assert!(matches!(
            classify_client_error("ssh: connect to host 1.2.3.4 port 22: Connection refused"),
            TransportError::Connection(_)
        ));
    }

    #[test]
    fn test_check_transfer_maps_failures() {
        let ok = CommandOutput::default();
        assert!(check_transfer(&ok).is_ok());

        let refused = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "ssh: connect to host h port 22: Connection refused".into(),
        };
        assert!(matches!(
            check_transfer(&refused),
            Err(TransportError::Connection(_))
        ));

        let missing = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "scp: /w/outputs: No such file or directory".into(),
        };
        assert!(matches!(
            check_transfer(&missing),
            Err(TransportError::Transfer(_))
        ));
    }
}
