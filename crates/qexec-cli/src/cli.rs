//! Command line flags.

use crate::config::QexecConfig;
use clap::Parser;
use qexec_conf::IgnitionVersion;
use qexec_core::{LaunchOptions, Platform, PlatformOptions};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "qexec",
    version,
    about = "Directly execute QEMU on a CoreOS instance"
)]
pub struct Cli {
    /// Memory in MiB (0 keeps the platform default).
    #[arg(short, long, default_value_t = 0)]
    pub memory: u32,

    /// Additional disk, human readable size (repeatable).
    #[arg(short = 'D', long = "add-disk")]
    pub add_disks: Vec<String>,

    /// Enable usermode networking.
    #[arg(short = 'U', long, default_value_t = false)]
    pub usernet: bool,

    /// Automatically set number of cpus to host count.
    #[arg(long, default_value_t = false)]
    pub auto_cpus: bool,

    /// Append well-known Ignition fragments: autologin.
    #[arg(long = "add-ignition", value_delimiter = ',')]
    pub fragments: Vec<String>,

    /// Set hostname via DHCP.
    #[arg(long, default_value = "")]
    pub hostname: String,

    /// Do not parse Ignition, pass directly to instance.
    #[arg(long, default_value_t = false)]
    pub ignition_direct: bool,

    /// Enable development shell.
    #[arg(long, default_value_t = false)]
    pub devshell: bool,

    /// Connect directly to serial console in devshell mode.
    #[arg(short = 'c', long, default_value_t = false)]
    pub devshell_console: bool,

    /// Path to ignition config.
    #[arg(short, long)]
    pub ignition: Option<PathBuf>,

    /// Mount readonly via 9p a host directory: --bind-ro=/path/to/host,/var/mnt/guest
    #[arg(long = "bind-ro")]
    pub bind_ro: Vec<String>,

    /// Same as --bind-ro, but writable.
    #[arg(long = "bind-rw")]
    pub bind_rw: Vec<String>,

    /// Force injecting the Ignition config into the boot disk.
    #[arg(long = "inject-ignition", default_value_t = false)]
    pub inject_ignition: bool,

    /// Error out if the system fails in the initramfs.
    #[arg(long, default_value_t = false)]
    pub propagate_initramfs_failure: bool,

    /// File in which to save serial console logs.
    #[arg(long = "console-to-file")]
    pub console_to_file: Option<PathBuf>,

    /// Additional kernel arguments applied.
    #[arg(long, default_value = "")]
    pub kargs: String,

    /// Arguments for Ignition networking on the kernel command line.
    #[arg(long, default_value = "")]
    pub knetargs: String,

    /// Platform to run on: qemu or qemu-iso.
    #[arg(short, long, default_value = "qemu")]
    pub platform: Platform,

    /// Boot disk image.
    #[arg(long)]
    pub qemu_image: Option<PathBuf>,

    /// ISO to attach.
    #[arg(long)]
    pub qemu_iso: Option<PathBuf>,

    /// Firmware: bios, uefi, uefi-secure, or a path.
    #[arg(long, default_value = "bios")]
    pub qemu_firmware: String,

    /// Attach the boot disk over NVMe.
    #[arg(long, default_value_t = false)]
    pub qemu_nvme: bool,

    /// Use 4k sectors on the boot disk.
    #[arg(long = "qemu-native-4k", default_value_t = false)]
    pub qemu_native_4k: bool,

    /// Expose the boot disk through two paths.
    #[arg(long, default_value_t = false)]
    pub qemu_multipath: bool,

    /// Serve the boot disk over NBD.
    #[arg(long, default_value_t = false)]
    pub qemu_nbd: bool,

    /// Grow the boot disk to this size.
    #[arg(long)]
    pub qemu_size: Option<String>,

    /// Render configs as Ignition spec 2.
    #[arg(long, default_value_t = false)]
    pub ignition_v2: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Arguments passed through to QEMU (after --).
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Split the flags into launch options and platform options.
    pub fn into_options(self, config: &QexecConfig) -> (LaunchOptions, PlatformOptions) {
        let opts = LaunchOptions {
            memory_mib: self.memory,
            add_disks: self.add_disks,
            usernet: self.usernet,
            cpu_count_host: self.auto_cpus,
            hostname: self.hostname,
            ignition: self.ignition,
            kargs: self.kargs,
            knetargs: self.knetargs,
            fragments: self.fragments,
            bind_ro: self.bind_ro,
            bind_rw: self.bind_rw,
            direct_ignition: self.ignition_direct,
            force_config_injection: self.inject_ignition,
            propagate_initramfs_failure: self.propagate_initramfs_failure,
            devshell: self.devshell,
            devshell_console: self.devshell_console,
            console_file: self.console_to_file,
            args: self.args,
        };

        let platform = PlatformOptions {
            platform: self.platform,
            disk_image: self.qemu_image,
            disk_size: self.qemu_size,
            firmware: self.qemu_firmware,
            nvme: self.qemu_nvme,
            native_4k: self.qemu_native_4k,
            multipath: self.qemu_multipath,
            nbd: self.qemu_nbd,
            iso_path: self.qemu_iso,
            workdir: config.workdir.clone(),
            ignition_version: if self.ignition_v2 {
                IgnitionVersion::V2
            } else {
                IgnitionVersion::V3
            },
            qemu_path: config.qemu_path.clone(),
            qemu_img_path: config.qemu_img_path.clone(),
            qemu_nbd_path: config.qemu_nbd_path.clone(),
            guestfish_path: config.guestfish_path.clone(),
            state_dir: config.state_dir.clone(),
        };

        (opts, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("qexec").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let (opts, platform) = parse(&[]).into_options(&QexecConfig::default());
        assert_eq!(opts.memory_mib, 0);
        assert!(opts.ignition.is_none());
        assert!(!opts.wants_devshell());
        assert_eq!(platform.platform, Platform::Qemu);
        assert_eq!(platform.firmware, "bios");
        assert_eq!(platform.ignition_version, IgnitionVersion::V3);
    }

    #[test]
    fn test_flags_map_to_options() {
        let cli = parse(&[
            "-m",
            "4096",
            "-D",
            "5G",
            "-D",
            "10G",
            "--add-ignition",
            "autologin,other",
            "--bind-ro",
            "/host/a,/guest/a",
            "--bind-rw=/host/b,/guest/b",
            "-i",
            "config.ign",
            "--qemu-image",
            "fcos.qcow2",
            "--qemu-nvme",
            "--ignition-v2",
            "-c",
            "--",
            "-snapshot",
        ]);
        let config = QexecConfig {
            workdir: Some("/srv/cosa".into()),
            ..Default::default()
        };
        let (opts, platform) = cli.into_options(&config);

        assert_eq!(opts.memory_mib, 4096);
        assert_eq!(opts.add_disks, vec!["5G", "10G"]);
        assert_eq!(opts.fragments, vec!["autologin", "other"]);
        assert_eq!(opts.bind_ro, vec!["/host/a,/guest/a"]);
        assert_eq!(opts.bind_rw, vec!["/host/b,/guest/b"]);
        assert_eq!(opts.ignition, Some(PathBuf::from("config.ign")));
        assert!(opts.devshell_console);
        assert_eq!(opts.args, vec!["-snapshot"]);
        assert_eq!(platform.disk_image, Some(PathBuf::from("fcos.qcow2")));
        assert!(platform.nvme);
        assert_eq!(platform.ignition_version, IgnitionVersion::V2);
        assert_eq!(platform.workdir, Some(PathBuf::from("/srv/cosa")));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = Cli::try_parse_from(["qexec", "--platform", "aws"]).unwrap_err();
        assert!(err.to_string().contains("aws"));
    }
}
