//! Launch and platform options.
//!
//! [`LaunchOptions`] holds what the user asked for; [`PlatformOptions`] holds
//! the host and platform settings the launch runs against. Both are parsed
//! once and passed by reference; neither is mutated afterwards.

use qexec_conf::IgnitionVersion;
use qexec_vm::MachineSpec;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Hostname handed to development shell guests when none is given.
pub const DEFAULT_DEVSHELL_HOSTNAME: &str = "cosa-devsh";

/// Fragment enabling console auto-login.
pub const FRAGMENT_AUTOLOGIN: &str = "autologin";

/// Everything the user asked for on one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Memory in MiB, 0 for the platform default
    pub memory_mib: u32,
    /// Additional blank disks, human readable sizes
    pub add_disks: Vec<String>,
    /// Enable user-mode networking
    pub usernet: bool,
    /// Use as many vCPUs as the host has
    pub cpu_count_host: bool,
    /// Hostname handed out over DHCP
    pub hostname: String,
    /// Path to an ignition config
    pub ignition: Option<PathBuf>,
    /// Kernel arguments appended to the boot entries
    pub kargs: String,
    /// Kernel arguments for first-boot networking
    pub knetargs: String,
    /// Well-known fragments applied to the config
    pub fragments: Vec<String>,
    /// Read-only shares as `SRC,DEST`
    pub bind_ro: Vec<String>,
    /// Read-write shares as `SRC,DEST`
    pub bind_rw: Vec<String>,
    /// Pass the ignition file through untouched
    pub direct_ignition: bool,
    /// Write the config into the boot disk
    pub force_config_injection: bool,
    /// Fail the run if the guest fails in the initramfs
    pub propagate_initramfs_failure: bool,
    /// Development shell over SSH
    pub devshell: bool,
    /// Development shell on the serial console
    pub devshell_console: bool,
    /// Capture the serial console into this file
    pub console_file: Option<PathBuf>,
    /// Arguments passed through to the hypervisor
    pub args: Vec<String>,
}

impl LaunchOptions {
    /// Whether any flavour of development shell was requested.
    pub fn wants_devshell(&self) -> bool {
        self.devshell || self.devshell_console
    }

    /// The ignition path, treating an empty one as not given.
    pub fn ignition_path(&self) -> Option<&Path> {
        self.ignition
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Platform the machine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    /// Boot from a disk image
    #[default]
    Qemu,
    /// Boot from an ISO
    QemuIso,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Qemu => write!(f, "qemu"),
            Platform::QemuIso => write!(f, "qemu-iso"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(Platform::Qemu),
            "qemu-iso" => Ok(Platform::QemuIso),
            other => Err(format!("unknown platform {other:?}, expected qemu or qemu-iso")),
        }
    }
}

/// Host and platform settings.
#[derive(Debug, Clone)]
pub struct PlatformOptions {
    pub platform: Platform,
    /// Boot disk image
    pub disk_image: Option<PathBuf>,
    /// Grow the boot disk to this size
    pub disk_size: Option<String>,
    /// `bios`, `uefi`, `uefi-secure`, or a firmware path
    pub firmware: String,
    pub nvme: bool,
    pub native_4k: bool,
    pub multipath: bool,
    pub nbd: bool,
    /// ISO attached to the machine
    pub iso_path: Option<PathBuf>,
    /// Build working directory shared with development shells
    pub workdir: Option<PathBuf>,
    /// Schema version configs are rendered against
    pub ignition_version: IgnitionVersion,
    pub qemu_path: PathBuf,
    pub qemu_img_path: PathBuf,
    pub qemu_nbd_path: PathBuf,
    pub guestfish_path: PathBuf,
    /// Parent directory of per-instance state
    pub state_dir: PathBuf,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        let spec = MachineSpec::default();
        Self {
            platform: Platform::Qemu,
            disk_image: None,
            disk_size: None,
            firmware: spec.firmware,
            nvme: false,
            native_4k: false,
            multipath: false,
            nbd: false,
            iso_path: None,
            workdir: None,
            ignition_version: IgnitionVersion::default(),
            qemu_path: spec.qemu_path,
            qemu_img_path: spec.qemu_img_path,
            qemu_nbd_path: spec.qemu_nbd_path,
            guestfish_path: spec.guestfish_path,
            state_dir: spec.state_dir,
        }
    }
}

impl PlatformOptions {
    /// Whether the boot image can mount 9p shares.
    ///
    /// RHCOS kernels ship without 9p, so images named `rhcos*` cannot.
    pub fn supports_9p(&self) -> bool {
        self.disk_image
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|name| !name.to_string_lossy().starts_with("rhcos"))
            .unwrap_or(true)
    }

    /// A machine spec carrying the host tool paths and state directory.
    pub fn base_spec(&self) -> MachineSpec {
        MachineSpec {
            qemu_path: self.qemu_path.clone(),
            qemu_img_path: self.qemu_img_path.clone(),
            qemu_nbd_path: self.qemu_nbd_path.clone(),
            guestfish_path: self.guestfish_path.clone(),
            state_dir: self.state_dir.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_9p() {
        let mut platform = PlatformOptions::default();
        assert!(platform.supports_9p());

        platform.disk_image = Some("/srv/fedora-coreos-36.qcow2".into());
        assert!(platform.supports_9p());

        platform.disk_image = Some("/srv/rhcos-410.qcow2".into());
        assert!(!platform.supports_9p());
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("qemu".parse::<Platform>().unwrap(), Platform::Qemu);
        assert_eq!("qemu-iso".parse::<Platform>().unwrap(), Platform::QemuIso);
        assert!("aws".parse::<Platform>().is_err());
        assert_eq!(Platform::QemuIso.to_string(), "qemu-iso");
    }

    #[test]
    fn test_base_spec_carries_paths() {
        let platform = PlatformOptions {
            qemu_path: "/opt/qemu/bin/qemu-system-x86_64".into(),
            state_dir: "/var/tmp/qexec".into(),
            ..Default::default()
        };
        let spec = platform.base_spec();
        assert_eq!(spec.qemu_path, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        assert_eq!(spec.state_dir, PathBuf::from("/var/tmp/qexec"));
        assert_eq!(spec.memory_mib, MachineSpec::default().memory_mib);
    }

    #[test]
    fn test_wants_devshell() {
        let opts = LaunchOptions {
            devshell_console: true,
            ..Default::default()
        };
        assert!(opts.wants_devshell());
        assert!(!LaunchOptions::default().wants_devshell());
    }

    #[test]
    fn test_empty_ignition_path_is_absent() {
        let mut opts = LaunchOptions {
            ignition: Some(PathBuf::new()),
            ..Default::default()
        };
        assert_eq!(opts.ignition_path(), None);

        opts.ignition = Some("/srv/config.ign".into());
        assert_eq!(opts.ignition_path(), Some(Path::new("/srv/config.ign")));
    }
}
