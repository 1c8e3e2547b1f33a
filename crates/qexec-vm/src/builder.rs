//! Builder for QEMU machines.

use crate::config::{ConfigSource, Disk, HostForwardPort, Iso, MachineSpec, Mount9p};
use crate::error::{Result, VmError};
use crate::instance::QemuInstance;
use qexec_conf::Conf;
use std::path::PathBuf;

/// Incrementally describes a machine, then launches it.
///
/// Methods take `&mut self` so callers can populate the builder
/// conditionally.
///
/// # Example
///
/// ```no_run
/// use qexec_vm::{Disk, HostForwardPort, QemuBuilder};
///
/// # async fn example() -> qexec_vm::Result<()> {
/// let mut builder = QemuBuilder::new();
/// builder
///     .add_boot_disk(Disk {
///         backing_file: Some("fedora-coreos.qcow2".into()),
///         ..Default::default()
///     })?
///     .set_memory(4096)
///     .enable_usermode_networking(vec![HostForwardPort::ssh()]);
///
/// let instance = builder.launch().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct QemuBuilder {
    spec: MachineSpec,
}

impl QemuBuilder {
    /// Create a builder with the default machine spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing spec, e.g. one carrying binary paths.
    pub fn from_spec(spec: MachineSpec) -> Self {
        Self { spec }
    }

    /// Set the disk the machine boots from.
    ///
    /// # Errors
    /// Returns an error if the disk is invalid or a boot disk is already set.
    pub fn add_boot_disk(&mut self, disk: Disk) -> Result<&mut Self> {
        if self.spec.boot_disk.is_some() {
            return Err(VmError::Config("boot disk already set".into()));
        }
        disk.validate()?;
        self.spec.boot_disk = Some(disk);
        Ok(self)
    }

    /// Attach an additional disk.
    ///
    /// # Errors
    /// Returns an error if the disk is invalid.
    pub fn add_disk(&mut self, disk: Disk) -> Result<&mut Self> {
        disk.validate()?;
        self.spec.disks.push(disk);
        Ok(self)
    }

    /// Attach a CD-ROM image.
    ///
    /// # Errors
    /// Returns an error if the path is empty.
    pub fn add_iso(&mut self, path: impl Into<PathBuf>, label: Option<String>) -> Result<&mut Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(VmError::Config("ISO path is empty".into()));
        }
        self.spec.isos.push(Iso { path, label });
        Ok(self)
    }

    /// Share a host directory into the guest.
    pub fn mount_9p(
        &mut self,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<String>,
        read_only: bool,
    ) -> &mut Self {
        self.spec.mounts.push(Mount9p {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            read_only,
        });
        self
    }

    /// Turn on user-mode networking with the given forwards.
    pub fn enable_usermode_networking(&mut self, forwards: Vec<HostForwardPort>) -> &mut Self {
        self.spec.usermode_forwards = Some(forwards);
        self
    }

    pub fn set_memory(&mut self, mib: u32) -> &mut Self {
        self.spec.memory_mib = mib;
        self
    }

    /// vCPU count, or [`crate::PROCESSORS_HOST`].
    pub fn set_processors(&mut self, processors: i32) -> &mut Self {
        self.spec.processors = processors;
        self
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.spec.hostname = hostname.into();
        self
    }

    pub fn set_firmware(&mut self, firmware: impl Into<String>) -> &mut Self {
        self.spec.firmware = firmware.into();
        self
    }

    /// Append kernel arguments to the boot entries.
    pub fn append_kernel_args(&mut self, kargs: &str) -> &mut Self {
        append_words(&mut self.spec.kernel_args, kargs);
        self
    }

    /// Kernel arguments used only for first-boot networking.
    pub fn set_network_kernel_args(&mut self, kargs: impl Into<String>) -> &mut Self {
        self.spec.network_kernel_args = kargs.into();
        self
    }

    /// Write the config into the boot disk instead of using fw_cfg.
    pub fn force_config_injection(&mut self, force: bool) -> &mut Self {
        self.spec.force_config_injection = force;
        self
    }

    pub fn set_inherit_console(&mut self, inherit: bool) -> &mut Self {
        self.spec.inherit_console = inherit;
        self
    }

    pub fn set_console_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.spec.console_file = Some(path.into());
        self
    }

    /// Hand a rendered config to the guest.
    ///
    /// # Errors
    /// Returns an error if the config cannot be serialized.
    pub fn set_config(&mut self, conf: &Conf) -> Result<&mut Self> {
        self.spec.config = ConfigSource::Rendered(conf.to_json_string()?);
        Ok(self)
    }

    /// Hand a config file to the guest unmodified.
    pub fn set_config_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.spec.config = ConfigSource::File(path.into());
        self
    }

    /// Append raw arguments to the QEMU command line.
    pub fn append<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The machine spec built so far.
    pub fn build_config(&self) -> MachineSpec {
        self.spec.clone()
    }

    /// Launch the described machine.
    ///
    /// # Errors
    /// Returns an error if the machine spec is invalid or the launch fails.
    pub async fn launch(self) -> Result<QemuInstance> {
        QemuInstance::create(self.spec).await
    }
}

fn append_words(target: &mut String, words: &str) {
    let words = words.trim();
    if words.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(words);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskChannel;
    use qexec_conf::{render, IgnitionVersion, Source};

    #[test]
    fn test_builder_defaults() {
        let spec = QemuBuilder::new().build_config();
        assert_eq!(spec.memory_mib, 2048);
        assert!(spec.boot_disk.is_none());
        assert_eq!(spec.config, ConfigSource::None);
    }

    #[test]
    fn test_builder_populates_spec() {
        let mut builder = QemuBuilder::new();
        builder
            .add_boot_disk(Disk {
                backing_file: Some("/img/fcos.qcow2".into()),
                channel: DiskChannel::Nvme,
                ..Default::default()
            })
            .unwrap()
            .add_disk(Disk::from_size("5G"))
            .unwrap()
            .mount_9p("/host/a", "/guest/a", true)
            .set_hostname("cosa-devsh")
            .set_memory(4096)
            .enable_usermode_networking(vec![HostForwardPort::ssh()])
            .append(["-snapshot"]);

        let spec = builder.build_config();
        assert_eq!(spec.boot_disk.unwrap().channel, DiskChannel::Nvme);
        assert_eq!(spec.disks.len(), 1);
        assert_eq!(spec.mounts[0].tag(), qexec_conf::mount_tag("/guest/a"));
        assert_eq!(spec.hostname, "cosa-devsh");
        assert_eq!(spec.memory_mib, 4096);
        assert_eq!(spec.usermode_forwards.unwrap()[0].guest_port, 22);
        assert_eq!(spec.extra_args, vec!["-snapshot"]);
    }

    #[test]
    fn test_second_boot_disk_rejected() {
        let mut builder = QemuBuilder::new();
        builder.add_boot_disk(Disk::from_size("1G")).unwrap();
        assert!(builder.add_boot_disk(Disk::from_size("1G")).is_err());
    }

    #[test]
    fn test_invalid_disk_rejected() {
        let mut builder = QemuBuilder::new();
        assert!(builder.add_disk(Disk::from_size("lots")).is_err());
        assert!(builder.build_config().disks.is_empty());
    }

    #[test]
    fn test_kernel_args_accumulate() {
        let mut builder = QemuBuilder::new();
        builder
            .append_kernel_args("console=ttyS0")
            .append_kernel_args("  ")
            .append_kernel_args("debug");
        assert_eq!(builder.build_config().kernel_args, "console=ttyS0 debug");
    }

    #[test]
    fn test_config_sources() {
        let conf = render(&Source::Empty, IgnitionVersion::V3).unwrap();
        let mut builder = QemuBuilder::new();
        builder.set_config(&conf).unwrap();
        match builder.build_config().config {
            ConfigSource::Rendered(json) => assert!(json.contains("3.0.0")),
            other => panic!("unexpected config source: {other:?}"),
        }

        builder.set_config_file("/srv/config.ign");
        assert_eq!(
            builder.build_config().config,
            ConfigSource::File("/srv/config.ign".into())
        );
    }
}
