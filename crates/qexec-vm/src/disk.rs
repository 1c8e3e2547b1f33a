//! Disk preparation: overlays, blank images and NBD exports.

use crate::config::{parse_size, Disk};
use crate::error::{Result, VmError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// NBD socket wait timeout (total wait time = RETRY_COUNT * RETRY_DELAY)
const NBD_SOCKET_RETRY_COUNT: u32 = 50;
const NBD_SOCKET_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run a helper tool to completion, returning its stdout.
pub(crate) async fn run_tool(program: &Path, args: &[String]) -> Result<String> {
    tracing::trace!(program = %program.display(), ?args, "Running helper");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| VmError::Create(format!("failed to run {}: {e}", program.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VmError::Create(format!(
            "{} {} failed ({}): {}",
            program.display(),
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Guess an image's format from its extension.
pub(crate) fn backing_format(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => "qcow2",
        _ => "raw",
    }
}

/// Arguments for `qemu-img create` producing the instance's copy of `disk`.
pub(crate) fn create_image_args(disk: &Disk, backing: Option<&Path>, target: &Path) -> Vec<String> {
    let mut args = vec!["create".to_string(), "-f".to_string(), "qcow2".to_string()];
    if let Some(backing) = backing {
        args.extend([
            "-F".to_string(),
            backing_format(backing).to_string(),
            "-b".to_string(),
            backing.display().to_string(),
        ]);
    }
    args.push(target.display().to_string());
    if let Some(size) = &disk.size {
        args.push(size.clone());
    }
    args
}

/// Create the qcow2 image the instance writes to.
///
/// Backed disks get an overlay so the backing image is never modified;
/// size-only disks get a blank image.
pub(crate) async fn prepare_image(
    qemu_img: &Path,
    state_dir: &Path,
    id: &str,
    disk: &Disk,
) -> Result<PathBuf> {
    if let Some(size) = &disk.size {
        parse_size(size)?;
    }

    let backing = match &disk.backing_file {
        Some(path) => Some(tokio::fs::canonicalize(path).await.map_err(|e| {
            VmError::Create(format!("backing file {}: {e}", path.display()))
        })?),
        None => None,
    };

    let target = state_dir.join(format!("{id}.qcow2"));
    run_tool(qemu_img, &create_image_args(disk, backing.as_deref(), &target)).await?;
    tracing::debug!(
        disk = id,
        target = %target.display(),
        backing = ?backing,
        "Disk image prepared"
    );
    Ok(target)
}

/// URI QEMU opens for an image exported over a unix NBD socket.
pub(crate) fn nbd_uri(socket: &Path) -> String {
    format!("nbd:unix:{}", socket.display())
}

/// Export `image` over NBD and wait for the socket to appear.
pub(crate) async fn spawn_nbd(qemu_nbd: &Path, image: &Path, socket: &Path) -> Result<Child> {
    let mut child = Command::new(qemu_nbd)
        .arg("--format=qcow2")
        .arg("--shared=4")
        .arg(format!("--socket={}", socket.display()))
        .arg(image)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VmError::Create(format!("failed to run {}: {e}", qemu_nbd.display())))?;

    for _ in 0..NBD_SOCKET_RETRY_COUNT {
        if socket.exists() {
            tracing::debug!(socket = %socket.display(), "NBD export ready");
            return Ok(child);
        }
        if let Some(status) = child.try_wait()? {
            return Err(VmError::Create(format!(
                "qemu-nbd exited early ({status}) serving {}",
                image.display()
            )));
        }
        tokio::time::sleep(NBD_SOCKET_RETRY_DELAY).await;
    }

    let _ = child.kill().await;
    Err(VmError::Create(format!(
        "timed out waiting for NBD socket {}",
        socket.display()
    )))
}
