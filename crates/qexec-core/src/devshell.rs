//! Development shell sessions.
//!
//! [`DevShell`] is the seam the driver runs a session through;
//! [`SshDevShell`] runs the system `ssh` client against the guest's
//! forwarded port with a throwaway key authorized in the first-boot config.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use qexec_conf::Conf;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Exit code ssh uses for its own errors, including refused connections.
const SSH_EXIT_ERROR: i32 = 255;

/// Delay between connection attempts while the guest boots.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long the guest gets to start accepting SSH.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

const KEY_FILE: &str = "id_ed25519";

/// An interactive session into a running guest.
#[async_trait]
pub trait DevShell: Send + Sync {
    /// Adjust the first-boot config before launch.
    async fn prepare(&mut self, conf: &mut Conf) -> Result<()>;

    /// Run a session against `addr` until it ends or `cancel` fires.
    async fn run(&self, addr: SocketAddr, cancel: &CancellationToken) -> Result<()>;
}

/// Development shell over the system SSH client.
#[derive(Debug)]
pub struct SshDevShell {
    program: PathBuf,
    keygen: PathBuf,
    user: String,
    retry_delay: Duration,
    ready_timeout: Duration,
    key_dir: Option<TempDir>,
}

impl SshDevShell {
    pub fn new(program: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            keygen: PathBuf::from("ssh-keygen"),
            user: user.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            key_dir: None,
        }
    }

    /// Use a different `ssh-keygen` binary.
    pub fn with_keygen(mut self, keygen: impl Into<PathBuf>) -> Self {
        self.keygen = keygen.into();
        self
    }

    /// Set the retry delay and the overall wait for the guest's SSH server.
    pub fn with_retry(mut self, delay: Duration, timeout: Duration) -> Self {
        self.retry_delay = delay;
        self.ready_timeout = timeout;
        self
    }

    fn key_path(&self) -> Option<PathBuf> {
        self.key_dir.as_ref().map(|dir| dir.path().join(KEY_FILE))
    }

    /// Client arguments for a session against `addr`.
    fn ssh_args(&self, addr: SocketAddr, key: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ConnectTimeout=5",
            "-p",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(addr.port().to_string());
        if let Some(key) = key {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args.push(format!("{}@{}", self.user, addr.ip()));
        args
    }
}

#[async_trait]
impl DevShell for SshDevShell {
    async fn prepare(&mut self, conf: &mut Conf) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("qexec-ssh-")
            .tempdir()
            .map_err(|e| CoreError::DevShell(format!("creating key dir: {e}")))?;
        let key = dir.path().join(KEY_FILE);

        let output = Command::new(&self.keygen)
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "qexec-devshell", "-f"])
            .arg(&key)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                CoreError::DevShell(format!("failed to run {}: {e}", self.keygen.display()))
            })?;
        if !output.status.success() {
            return Err(CoreError::DevShell(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let public = tokio::fs::read_to_string(key.with_extension("pub"))
            .await
            .map_err(|e| CoreError::DevShell(format!("reading public key: {e}")))?;
        conf.add_authorized_key(&self.user, &public);
        tracing::debug!(user = %self.user, key = %key.display(), "Authorized devshell key");

        self.key_dir = Some(dir);
        Ok(())
    }

    async fn run(&self, addr: SocketAddr, cancel: &CancellationToken) -> Result<()> {
        let key = self.key_path();
        let args = self.ssh_args(addr, key.as_deref());
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut child = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    CoreError::DevShell(format!("failed to run {}: {e}", self.program.display()))
                })?;

            let status = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                status = child.wait() => status
                    .map_err(|e| CoreError::DevShell(format!("waiting for ssh: {e}")))?,
            };

            if status.code() != Some(SSH_EXIT_ERROR) {
                tracing::info!(%addr, attempt, %status, "Devshell session ended");
                return Ok(());
            }

            if start.elapsed() >= self.ready_timeout {
                return Err(CoreError::DevShell(format!(
                    "guest did not accept SSH on {addr} within {:?}",
                    self.ready_timeout
                )));
            }

            tracing::debug!(%addr, attempt, "Guest not reachable over SSH yet, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qexec_conf::{render, IgnitionVersion, Source};
    use std::os::unix::fs::PermissionsExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:40222".parse().unwrap()
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_ssh_args() {
        let shell = SshDevShell::new("ssh", "core");
        let args = shell.ssh_args(addr(), Some(Path::new("/tmp/k/id_ed25519")));
        let line = args.join(" ");
        assert!(line.contains("-p 40222"));
        assert!(line.contains("-i /tmp/k/id_ed25519"));
        assert!(line.contains("StrictHostKeyChecking=no"));
        assert_eq!(args.last().unwrap(), "core@127.0.0.1");

        let args = shell.ssh_args(addr(), None);
        assert!(!args.contains(&"-i".to_string()));
    }

    #[tokio::test]
    async fn test_session_end_is_success() {
        let shell = SshDevShell::new("false", "core");
        let cancel = CancellationToken::new();
        assert!(shell.run(addr(), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_when_guest_never_answers() {
        let dir = tempfile::tempdir().unwrap();
        let shell = SshDevShell::new(script(dir.path(), "exit 255"), "core")
            .with_retry(Duration::from_millis(10), Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let err = shell.run(addr(), &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::DevShell(ref msg) if msg.contains("did not accept SSH")));
    }

    #[tokio::test]
    async fn test_cancel_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let shell = SshDevShell::new(script(dir.path(), "exec sleep 30"), "core");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), shell.run(addr(), &cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_prepare_fails_without_keygen() {
        let mut shell = SshDevShell::new("ssh", "core").with_keygen("/nonexistent/ssh-keygen");
        let mut conf = render(&Source::Empty, IgnitionVersion::V3).unwrap();
        let err = shell.prepare(&mut conf).await.unwrap_err();
        assert!(matches!(err, CoreError::DevShell(_)));
        assert!(conf.as_value().get("passwd").is_none());
    }
}
