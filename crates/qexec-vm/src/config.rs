//! Configuration types for QEMU machines.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Processor count meaning "as many as the host has".
pub const PROCESSORS_HOST: i32 = -1;

/// Sector size that switches a disk to native 4k.
pub const NATIVE_4K_SECTOR_SIZE: u32 = 4096;

/// Bus a disk is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskChannel {
    /// virtio-blk
    #[default]
    Virtio,
    /// Emulated NVMe controller
    Nvme,
}

impl fmt::Display for DiskChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskChannel::Virtio => write!(f, "virtio"),
            DiskChannel::Nvme => write!(f, "nvme"),
        }
    }
}

/// A block device attached to the machine.
///
/// Either `backing_file` or `size` must be set. A backing file is never
/// written to: the instance runs on a copy-on-write overlay. `size` on a
/// backed disk grows the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Image the disk is layered on
    pub backing_file: Option<PathBuf>,
    /// Human readable size, e.g. `10G`
    pub size: Option<String>,
    /// Attachment bus
    pub channel: DiskChannel,
    /// 0 for the hypervisor default, or 4096
    pub sector_size: u32,
    /// Expose the disk through two paths
    pub multipath: bool,
    /// Serve the disk through a network block device helper
    pub nbd: bool,
}

impl Disk {
    /// A blank disk of the given size.
    pub fn from_size(size: impl Into<String>) -> Self {
        Self {
            size: Some(size.into()),
            ..Default::default()
        }
    }

    /// Validate the disk description.
    ///
    /// # Errors
    /// Returns an error if neither a backing file nor a size is set, the
    /// size does not parse, or the sector size is unsupported.
    pub fn validate(&self) -> Result<()> {
        if self.backing_file.is_none() && self.size.is_none() {
            return Err(VmError::Config(
                "disk needs a backing file or a size".into(),
            ));
        }
        if let Some(size) = &self.size {
            parse_size(size)?;
        }
        if self.sector_size != 0 && self.sector_size != NATIVE_4K_SECTOR_SIZE {
            return Err(VmError::Config(format!(
                "unsupported sector size {}, expected 0 or {NATIVE_4K_SECTOR_SIZE}",
                self.sector_size
            )));
        }
        if self.multipath && self.channel == DiskChannel::Nvme {
            return Err(VmError::Config(
                "multipath disks cannot use the nvme channel".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a human readable size (`512M`, `10G`, `1T`, plain bytes) into bytes.
///
/// # Errors
/// Returns an error for empty input, unknown suffixes, or overflow.
pub fn parse_size(spec: &str) -> Result<u64> {
    let spec = spec.trim();
    let bad = || VmError::Config(format!("invalid disk size {spec:?}"));

    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, suffix) = spec.split_at(split);
    if digits.is_empty() {
        return Err(bad());
    }
    let value: u64 = digits.parse().map_err(|_| bad())?;

    let shift = match suffix.to_ascii_uppercase().trim_end_matches(['B', 'I']) {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(bad()),
    };
    value.checked_mul(1u64 << shift).ok_or_else(bad)
}

/// A CD-ROM image attached to the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso {
    /// Path to the ISO on the host
    pub path: PathBuf,
    /// Optional device serial the guest can find the media by
    pub label: Option<String>,
}

/// A host directory shared into the guest over 9p.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount9p {
    /// Directory on the host
    pub host_path: PathBuf,
    /// Mount point inside the guest
    pub guest_path: String,
    /// Share read-only
    pub read_only: bool,
}

impl Mount9p {
    /// Tag the guest mounts the share by.
    pub fn tag(&self) -> String {
        qexec_conf::mount_tag(&self.guest_path)
    }
}

/// A host TCP port forwarded to a guest port under user-mode networking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostForwardPort {
    /// Service name, used for lookups and logging
    pub service: String,
    /// Host port, 0 for an ephemeral port chosen at launch
    pub host_port: u16,
    /// Guest port
    pub guest_port: u16,
}

impl HostForwardPort {
    /// Forward an ephemeral host port to guest port 22.
    pub fn ssh() -> Self {
        Self {
            service: "ssh".into(),
            host_port: 0,
            guest_port: 22,
        }
    }
}

/// Where the guest's first-boot config comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// No config is handed to the guest
    #[default]
    None,
    /// A rendered document, serialized to JSON
    Rendered(String),
    /// A file passed through unmodified
    File(PathBuf),
}

/// Complete description of a machine to launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Boot disk (optional, e.g. for ISO boots)
    pub boot_disk: Option<Disk>,
    /// Additional disks in attach order
    pub disks: Vec<Disk>,
    /// Attached CD-ROM images
    pub isos: Vec<Iso>,
    /// 9p shares
    pub mounts: Vec<Mount9p>,
    /// `bios`, `uefi`, `uefi-secure`, or a path to a firmware file
    pub firmware: String,
    /// Hostname handed out over DHCP by user-mode networking
    pub hostname: String,
    /// Memory in MiB
    pub memory_mib: u32,
    /// vCPU count, or [`PROCESSORS_HOST`]
    pub processors: i32,
    /// User-mode networking forwards; `None` disables networking
    pub usermode_forwards: Option<Vec<HostForwardPort>>,
    /// Kernel arguments appended to the boot entries
    pub kernel_args: String,
    /// Kernel arguments used for first-boot networking
    pub network_kernel_args: String,
    /// Attach QEMU to this process's terminal
    pub inherit_console: bool,
    /// Capture the serial console into this file
    pub console_file: Option<PathBuf>,
    /// Write the first-boot config into the boot disk instead of fw_cfg
    pub force_config_injection: bool,
    /// First-boot config
    pub config: ConfigSource,
    /// Arguments appended verbatim to the QEMU command line
    pub extra_args: Vec<String>,
    /// QEMU system emulator binary
    pub qemu_path: PathBuf,
    /// `qemu-img` binary
    pub qemu_img_path: PathBuf,
    /// `qemu-nbd` binary
    pub qemu_nbd_path: PathBuf,
    /// `guestfish` binary
    pub guestfish_path: PathBuf,
    /// Parent directory for per-instance state
    pub state_dir: PathBuf,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            boot_disk: None,
            disks: Vec::new(),
            isos: Vec::new(),
            mounts: Vec::new(),
            firmware: "bios".into(),
            hostname: String::new(),
            memory_mib: 2048,
            processors: 1,
            usermode_forwards: None,
            kernel_args: String::new(),
            network_kernel_args: String::new(),
            inherit_console: false,
            console_file: None,
            force_config_injection: false,
            config: ConfigSource::None,
            extra_args: Vec::new(),
            qemu_path: PathBuf::from("qemu-system-x86_64"),
            qemu_img_path: PathBuf::from("qemu-img"),
            qemu_nbd_path: PathBuf::from("qemu-nbd"),
            guestfish_path: PathBuf::from("guestfish"),
            state_dir: PathBuf::from("/tmp/qexec"),
        }
    }
}

impl MachineSpec {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.memory_mib == 0 {
            return Err(VmError::Config("memory_mib must be > 0".into()));
        }

        if self.processors == 0 || self.processors < PROCESSORS_HOST {
            return Err(VmError::Config(format!(
                "processors must be >= 1 or {PROCESSORS_HOST}, got {}",
                self.processors
            )));
        }

        for disk in self.boot_disk.iter().chain(&self.disks) {
            disk.validate()?;
        }

        if self.needs_preboot_edit() && self.boot_disk.is_none() {
            return Err(VmError::Config(
                "kernel arguments and forced config injection require a boot disk".into(),
            ));
        }

        if self.force_config_injection && self.config == ConfigSource::None {
            return Err(VmError::Config(
                "forced config injection requires a config".into(),
            ));
        }

        // Guest mount tags must be unique or shares shadow each other
        let mut tags: Vec<String> = Vec::new();
        for mount in &self.mounts {
            if !mount.guest_path.starts_with('/') {
                return Err(VmError::Config(format!(
                    "guest mount path must be absolute: {}",
                    mount.guest_path
                )));
            }
            let tag = mount.tag();
            if tags.contains(&tag) {
                return Err(VmError::Config(format!("duplicate 9p mount tag: {tag}")));
            }
            tags.push(tag);
        }

        Ok(())
    }

    /// Whether the boot disk has to be edited before the first boot.
    pub fn needs_preboot_edit(&self) -> bool {
        self.force_config_injection
            || !self.kernel_args.is_empty()
            || !self.network_kernel_args.is_empty()
    }

    /// Resolve [`PROCESSORS_HOST`] to the host's CPU count.
    pub fn effective_processors(&self) -> u32 {
        if self.processors == PROCESSORS_HOST {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        } else {
            self.processors.max(1) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec() {
        let spec = MachineSpec::default();
        assert_eq!(spec.memory_mib, 2048);
        assert_eq!(spec.processors, 1);
        assert_eq!(spec.firmware, "bios");
        assert!(spec.usermode_forwards.is_none());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("10G").unwrap(), 10 << 30);
        assert_eq!(parse_size("5GiB").unwrap(), 5 << 30);
        assert_eq!(parse_size("2t").unwrap(), 2 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("99999999999999999999T").is_err());
    }

    #[test]
    fn test_disk_validation() {
        assert!(Disk::default().validate().is_err());
        assert!(Disk::from_size("5G").validate().is_ok());
        assert!(Disk::from_size("five").validate().is_err());

        let disk = Disk {
            sector_size: 512,
            ..Disk::from_size("1G")
        };
        assert!(disk.validate().is_err());

        let disk = Disk {
            multipath: true,
            channel: DiskChannel::Nvme,
            ..Disk::from_size("1G")
        };
        assert!(disk.validate().is_err());
    }

    #[test]
    fn test_processors_validation() {
        let spec = MachineSpec {
            processors: PROCESSORS_HOST,
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
        assert!(spec.effective_processors() >= 1);

        let spec = MachineSpec {
            processors: 0,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_kargs_require_boot_disk() {
        let spec = MachineSpec {
            kernel_args: "console=ttyS0".into(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    fn mount(host: &str, guest: &str) -> Mount9p {
        Mount9p {
            host_path: host.into(),
            guest_path: guest.into(),
            read_only: true,
        }
    }

    #[test]
    fn test_duplicate_guest_paths_rejected() {
        let spec = MachineSpec {
            mounts: vec![mount("/a", "/srv/data"), mount("/b", "/srv/data/")],
            ..Default::default()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate 9p mount tag"));
    }

    #[test]
    fn test_mounts_sharing_basename_accepted() {
        let spec = MachineSpec {
            mounts: vec![
                mount("/h1", "/var/mnt/a/data"),
                mount("/h2", "/var/mnt/b/data"),
            ],
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
        assert_ne!(spec.mounts[0].tag(), spec.mounts[1].tag());
    }

    #[test]
    fn test_disk_channel_display() {
        assert_eq!(DiskChannel::Virtio.to_string(), "virtio");
        assert_eq!(DiskChannel::Nvme.to_string(), "nvme");
    }
}
