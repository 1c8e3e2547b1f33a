//! Running instances.
//!
//! [`Instance`] is the seam the orchestrator drives; [`QemuInstance`] backs it
//! with a supervised QEMU process plus whatever helper processes and files its
//! disks need.

use crate::args::{qemu_args, LaunchLayout, ResolvedDisk};
use crate::config::{ConfigSource, HostForwardPort, MachineSpec};
use crate::disk;
use crate::error::{Result, VmError};
use crate::inject;
use crate::watch;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A launched machine.
#[async_trait]
pub trait Instance: Send {
    /// Unique identifier of this instance.
    fn id(&self) -> Uuid;

    /// Host address forwarded to the guest's SSH port, if networking is on.
    fn ssh_address(&self) -> Option<SocketAddr>;

    /// Wait for the machine to exit.
    async fn wait(&mut self) -> Result<()>;

    /// Wait for the machine to exit while also watching for boot failures.
    ///
    /// Returns [`VmError::Cancelled`] if `cancel` fires first and
    /// [`VmError::BootFailure`] if the guest reports an initramfs failure.
    async fn wait_all(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Kill the machine and release everything it holds. Idempotent.
    async fn destroy(&mut self);
}

/// Lifecycle of a [`QemuInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Resources are being staged
    Creating,
    /// QEMU is running
    Running,
    /// QEMU has exited, resources still held
    Exited,
    /// Everything released
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Creating => write!(f, "creating"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Exited => write!(f, "exited"),
            InstanceState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A machine running under QEMU.
pub struct QemuInstance {
    id: Uuid,
    spec: MachineSpec,
    state: InstanceState,
    /// `<spec.state_dir>/<id>`
    state_dir: PathBuf,
    layout: LaunchLayout,
    qemu: Option<Child>,
    /// qemu-nbd exports
    helpers: Vec<Child>,
}

impl QemuInstance {
    /// Stage resources for `spec` and start QEMU.
    ///
    /// This will:
    /// 1. Create the per-instance state directory
    /// 2. Write the rendered first-boot config
    /// 3. Create disk overlays and apply pre-boot edits to the boot disk
    /// 4. Start NBD exports
    /// 5. Resolve ephemeral forwarded ports and spawn QEMU
    ///
    /// Anything staged before a failure is released before returning.
    ///
    /// # Errors
    /// Returns an error if the machine spec is invalid or any step fails.
    pub async fn create(spec: MachineSpec) -> Result<Self> {
        spec.validate()?;

        let id = Uuid::new_v4();
        let start = Instant::now();
        tracing::info!(instance_id = %id, "Creating QEMU instance");
        if tracing::enabled!(tracing::Level::DEBUG) {
            match serde_json::to_string(&spec) {
                Ok(json) => tracing::debug!(instance_id = %id, spec = %json, "Machine spec"),
                Err(e) => tracing::debug!(instance_id = %id, error = %e, "Machine spec not serializable"),
            }
        }

        let state_dir = spec.state_dir.join(id.to_string());
        let mut instance = Self {
            id,
            spec,
            state: InstanceState::Creating,
            state_dir,
            layout: LaunchLayout::default(),
            qemu: None,
            helpers: Vec::new(),
        };

        if let Err(e) = instance.start().await {
            tracing::error!(instance_id = %id, error = %e, "Launch failed, releasing resources");
            instance.destroy().await;
            return Err(e);
        }

        tracing::info!(
            instance_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "QEMU instance started"
        );
        Ok(instance)
    }

    async fn start(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await.map_err(|e| {
            VmError::Create(format!("state dir {}: {e}", self.state_dir.display()))
        })?;

        let config_path = match &self.spec.config {
            ConfigSource::None => None,
            ConfigSource::Rendered(json) => {
                let path = self.state_dir.join("config.ign");
                tokio::fs::write(&path, json).await?;
                Some(path)
            }
            ConfigSource::File(path) => Some(path.clone()),
        };

        let disks: Vec<_> = self
            .spec
            .boot_disk
            .iter()
            .map(|d| (d.clone(), true))
            .chain(self.spec.disks.iter().map(|d| (d.clone(), false)))
            .collect();

        let mut resolved = Vec::with_capacity(disks.len());
        for (i, (disk, boot)) in disks.into_iter().enumerate() {
            let id = format!("disk{i}");
            let image =
                disk::prepare_image(&self.spec.qemu_img_path, &self.state_dir, &id, &disk).await?;

            if boot && self.spec.needs_preboot_edit() {
                inject::preboot_edit(&self.spec, &image, config_path.as_deref()).await?;
            }

            let (file, format) = if disk.nbd {
                let socket = self.state_dir.join(format!("{id}.sock"));
                let helper = disk::spawn_nbd(&self.spec.qemu_nbd_path, &image, &socket).await?;
                self.helpers.push(helper);
                (disk::nbd_uri(&socket), "raw")
            } else {
                (image.display().to_string(), "qcow2")
            };

            resolved.push(ResolvedDisk {
                id,
                file,
                format,
                disk,
                boot,
            });
        }

        let forwards = match &self.spec.usermode_forwards {
            Some(forwards) => resolve_forwards(forwards).await?,
            None => Vec::new(),
        };

        // An injected config must not also be offered over fw_cfg
        let fw_cfg = if self.spec.force_config_injection {
            None
        } else {
            config_path
        };

        self.layout = LaunchLayout {
            disks: resolved,
            config_path: fw_cfg,
            journal_path: self.state_dir.join("journal.txt"),
            forwards,
            cpus: self.spec.effective_processors(),
        };

        let args = qemu_args(&self.spec, &self.layout);
        tracing::trace!(instance_id = %self.id, qemu = %self.spec.qemu_path.display(), ?args, "QEMU argv");

        let mut cmd = Command::new(&self.spec.qemu_path);
        cmd.args(&args).kill_on_drop(true);
        if self.spec.inherit_console {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            VmError::Start(format!("failed to run {}: {e}", self.spec.qemu_path.display()))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let id = self.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "qemu", instance_id = %id, "{}", line);
                }
            });
        }

        self.qemu = Some(child);
        self.state = InstanceState::Running;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// The machine spec this instance was launched from.
    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    /// Per-instance state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Values resolved at launch: disks, forwarded ports, journal capture.
    pub fn layout(&self) -> &LaunchLayout {
        &self.layout
    }

    fn running_child(&mut self) -> Result<&mut Child> {
        let state = self.state;
        match (state, self.qemu.as_mut()) {
            (InstanceState::Running | InstanceState::Exited, Some(child)) => Ok(child),
            _ => Err(VmError::InvalidState {
                expected: "running".into(),
                actual: state.to_string(),
            }),
        }
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.state = InstanceState::Exited;
        tracing::info!(instance_id = %self.id, %status, "QEMU exited");
    }
}

#[async_trait]
impl Instance for QemuInstance {
    fn id(&self) -> Uuid {
        self.id
    }

    fn ssh_address(&self) -> Option<SocketAddr> {
        self.layout
            .forwards
            .iter()
            .find(|f| f.service == "ssh")
            .map(|f| SocketAddr::from((Ipv4Addr::LOCALHOST, f.host_port)))
    }

    async fn wait(&mut self) -> Result<()> {
        let status = self.running_child()?.wait().await?;
        self.mark_exited(status);
        exit_result(status)
    }

    async fn wait_all(&mut self, cancel: &CancellationToken) -> Result<()> {
        let journal = self.layout.journal_path.clone();
        let qemu = self.running_child()?;

        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            excerpt = watch::wait_for_failure(&journal) => {
                return Err(VmError::BootFailure(excerpt));
            }
            status = qemu.wait() => status?,
        };
        self.mark_exited(status);

        // The guest may have written its journal just before powering off
        if let Some(excerpt) = watch::read_failure(&journal).await {
            return Err(VmError::BootFailure(excerpt));
        }
        exit_result(status)
    }

    async fn destroy(&mut self) {
        if self.state == InstanceState::Destroyed {
            return;
        }
        tracing::info!(instance_id = %self.id, state = %self.state, "Destroying instance");

        if let Some(mut qemu) = self.qemu.take() {
            if self.state == InstanceState::Running {
                if let Err(e) = qemu.kill().await {
                    tracing::warn!(instance_id = %self.id, error = %e, "Failed to kill QEMU");
                }
            }
        }

        for mut helper in self.helpers.drain(..) {
            if let Err(e) = helper.kill().await {
                tracing::warn!(instance_id = %self.id, error = %e, "Failed to stop helper");
            }
        }

        match tokio::fs::remove_dir_all(&self.state_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                instance_id = %self.id,
                path = %self.state_dir.display(),
                error = %e,
                "Failed to remove state dir"
            ),
        }

        self.state = InstanceState::Destroyed;
    }
}

impl Drop for QemuInstance {
    fn drop(&mut self) {
        if self.state != InstanceState::Destroyed {
            // Child processes are killed by kill_on_drop
            tracing::warn!(instance_id = %self.id, "Instance dropped without destroy");
            let _ = std::fs::remove_dir_all(&self.state_dir);
        }
    }
}

fn exit_result(status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(VmError::Exited(status.to_string()))
    }
}

/// Fill in ephemeral host ports.
async fn resolve_forwards(forwards: &[HostForwardPort]) -> Result<Vec<HostForwardPort>> {
    let mut resolved = Vec::with_capacity(forwards.len());
    for fwd in forwards {
        let mut fwd = fwd.clone();
        if fwd.host_port == 0 {
            fwd.host_port = ephemeral_port().await?;
        }
        tracing::debug!(service = %fwd.service, host_port = fwd.host_port, guest_port = fwd.guest_port, "Port forward");
        resolved.push(fwd);
    }
    Ok(resolved)
}

async fn ephemeral_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}
