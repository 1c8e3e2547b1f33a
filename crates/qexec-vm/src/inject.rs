//! Pre-boot edits of the boot disk through guestfish.
//!
//! Kernel arguments, first-boot network arguments and (when forced) the
//! first-boot config are written into the boot partition before QEMU ever
//! starts. guestfish runs in remote mode so one appliance serves every edit.

use crate::config::MachineSpec;
use crate::error::{Result, VmError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Filesystem label of the boot partition.
const BOOT_LABEL: &str = "boot";

/// Where Ignition looks for an injected config on the boot partition.
const INJECTED_CONFIG_PATH: &str = "/ignition/config.ign";

/// GRUB fragment read on first boot only.
const FIRSTBOOT_PATH: &str = "/ignition.firstboot";

/// A guestfish appliance listening for remote commands.
struct Guestfish {
    program: PathBuf,
    pid: u32,
}

impl Guestfish {
    async fn launch(program: &Path, disk: &Path) -> Result<Self> {
        let output = Command::new(program)
            .arg("--listen")
            .arg("--rw")
            .arg("-a")
            .arg(disk)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::Inject(format!("failed to run {}: {e}", program.display())))?;

        if !output.status.success() {
            return Err(VmError::Inject(format!(
                "guestfish --listen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = parse_listen_pid(&stdout).ok_or_else(|| {
            VmError::Inject(format!("unexpected guestfish --listen output: {stdout:?}"))
        })?;
        tracing::debug!(pid, disk = %disk.display(), "guestfish appliance listening");

        Ok(Self {
            program: program.to_path_buf(),
            pid,
        })
    }

    async fn call(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .arg(format!("--remote={}", self.pid))
            .arg("--")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::Inject(format!("guestfish remote: {e}")))?;

        if !output.status.success() {
            return Err(VmError::Inject(format!(
                "guestfish {}: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn exit(self) {
        if let Err(e) = self.call(&["exit"]).await {
            tracing::warn!(pid = self.pid, error = %e, "guestfish did not exit cleanly");
        }
    }
}

/// Extract the PID from `GUESTFISH_PID=1234; export GUESTFISH_PID`.
fn parse_listen_pid(stdout: &str) -> Option<u32> {
    let rest = stdout.trim().strip_prefix("GUESTFISH_PID=")?;
    rest.split(';').next()?.trim().parse().ok()
}

/// Append `kargs` to the `options` line of a BLS entry.
pub(crate) fn append_kargs(entry: &str, kargs: &str) -> String {
    let mut out: Vec<String> = entry
        .lines()
        .map(|line| match line.strip_prefix("options ") {
            Some(opts) => format!("options {} {kargs}", opts.trim_end()),
            None => line.to_string(),
        })
        .collect();
    if !entry.lines().any(|l| l.starts_with("options ")) {
        out.push(format!("options {kargs}"));
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

/// GRUB snippet carrying first-boot network kernel arguments.
pub(crate) fn firstboot_contents(network_kargs: &str) -> String {
    format!("set ignition_network_kcmdline='{network_kargs}'\n")
}

/// Apply every pre-boot edit `spec` asks for to `boot_image`.
///
/// `config` is uploaded only when forced injection is enabled.
pub(crate) async fn preboot_edit(
    spec: &MachineSpec,
    boot_image: &Path,
    config: Option<&Path>,
) -> Result<()> {
    let start = std::time::Instant::now();
    let gf = Guestfish::launch(&spec.guestfish_path, boot_image).await?;
    let result = apply_edits(&gf, spec, config).await;
    gf.exit().await;

    if result.is_ok() {
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Boot disk edited"
        );
    }
    result
}

async fn apply_edits(gf: &Guestfish, spec: &MachineSpec, config: Option<&Path>) -> Result<()> {
    gf.call(&["run"]).await?;
    let device = gf.call(&["findfs-label", BOOT_LABEL]).await?;
    gf.call(&["mount", device.trim(), "/"]).await?;

    if spec.force_config_injection {
        let config = config.ok_or_else(|| {
            VmError::Inject("forced injection requested without a config".into())
        })?;
        let config = config.to_string_lossy();
        gf.call(&["mkdir-p", "/ignition"]).await?;
        gf.call(&["upload", &config, INJECTED_CONFIG_PATH]).await?;
        tracing::debug!("Injected first-boot config into boot partition");
    }

    if !spec.network_kernel_args.is_empty() {
        let contents = firstboot_contents(&spec.network_kernel_args);
        gf.call(&["write", FIRSTBOOT_PATH, &contents]).await?;
        tracing::debug!(knetargs = %spec.network_kernel_args, "Wrote first-boot network args");
    }

    if !spec.kernel_args.is_empty() {
        let entries = gf.call(&["glob-expand", "/loader/entries/*.conf"]).await?;
        for entry in entries.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let current = gf.call(&["cat", entry]).await?;
            let updated = append_kargs(&current, &spec.kernel_args);
            gf.call(&["write", entry, &updated]).await?;
            tracing::debug!(entry, kargs = %spec.kernel_args, "Appended kernel arguments");
        }
    }

    gf.call(&["umount-all"]).await?;
    Ok(())
}
