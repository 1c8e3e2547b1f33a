//! Machine assembly.
//!
//! [`EffectiveOptions`] layers the development shell defaults over the
//! user's options; [`assemble`] turns the result into a populated
//! [`QemuBuilder`].

use crate::bind::MountBinding;
use crate::error::{CoreError, Result};
use crate::mode::ExecutionMode;
use crate::options::{LaunchOptions, PlatformOptions, DEFAULT_DEVSHELL_HOSTNAME, FRAGMENT_AUTOLOGIN};
use crate::prepare::PreparedConfig;
use qexec_vm::{Disk, DiskChannel, HostForwardPort, QemuBuilder, NATIVE_4K_SECTOR_SIZE, PROCESSORS_HOST};

/// Guest mount point of the build working directory.
pub const WORKDIR_GUEST_PATH: &str = "/var/mnt/workdir";

/// Guest mount point of the working directory's `tmp`.
pub const WORKDIR_TMP_GUEST_PATH: &str = "/var/mnt/workdir-tmp";

/// The options a launch actually runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub mode: ExecutionMode,
    pub hostname: String,
    pub usernet: bool,
    pub cpu_count_host: bool,
    pub fragments: Vec<String>,
    pub bind_ro: Vec<String>,
    pub bind_rw: Vec<String>,
}

impl EffectiveOptions {
    /// Apply mode defaults on top of `opts`.
    pub fn derive(opts: &LaunchOptions, platform: &PlatformOptions) -> Self {
        let mut eff = Self {
            mode: ExecutionMode::from_options(opts),
            hostname: opts.hostname.clone(),
            usernet: opts.usernet,
            cpu_count_host: opts.cpu_count_host,
            fragments: opts.fragments.clone(),
            bind_ro: opts.bind_ro.clone(),
            bind_rw: opts.bind_rw.clone(),
        };

        if !eff.mode.is_devshell() {
            return eff;
        }

        eff.fragments.push(FRAGMENT_AUTOLOGIN.to_string());
        eff.cpu_count_host = true;
        eff.usernet = true;

        match &platform.workdir {
            Some(workdir) if platform.supports_9p() => {
                eff.bind_ro
                    .push(format!("{},{WORKDIR_GUEST_PATH}", workdir.display()));
                eff.bind_rw.push(format!(
                    "{},{WORKDIR_TMP_GUEST_PATH}",
                    workdir.join("tmp").display()
                ));
            }
            Some(workdir) => {
                tracing::debug!(workdir = %workdir.display(), "Image cannot mount 9p, not sharing workdir");
            }
            None => {}
        }

        if eff.hostname.is_empty() {
            eff.hostname = DEFAULT_DEVSHELL_HOSTNAME.to_string();
        }
        eff
    }
}

/// Populate a builder for the launch.
///
/// # Errors
/// Returns [`CoreError::Assembly`] if a disk, ISO or the config is rejected.
pub fn assemble(
    opts: &LaunchOptions,
    eff: &EffectiveOptions,
    platform: &PlatformOptions,
    bindings: &[MountBinding],
    config: &PreparedConfig,
) -> Result<QemuBuilder> {
    let mut builder = QemuBuilder::from_spec(platform.base_spec());

    for binding in bindings {
        builder.mount_9p(&binding.host_path, &binding.guest_path, binding.read_only);
    }

    builder.force_config_injection(opts.force_config_injection);
    if !opts.knetargs.is_empty() {
        builder.set_network_kernel_args(&opts.knetargs);
    }
    builder.append_kernel_args(&opts.kargs);
    builder.set_firmware(&platform.firmware);

    if let Some(image) = &platform.disk_image {
        let disk = Disk {
            backing_file: Some(image.clone()),
            size: platform.disk_size.clone(),
            channel: if platform.nvme {
                DiskChannel::Nvme
            } else {
                DiskChannel::Virtio
            },
            sector_size: if platform.native_4k {
                NATIVE_4K_SECTOR_SIZE
            } else {
                0
            },
            multipath: platform.multipath,
            nbd: platform.nbd,
        };
        builder.add_boot_disk(disk).map_err(|source| CoreError::Assembly {
            context: "adding boot disk",
            source,
        })?;
    }

    if let Some(iso) = &platform.iso_path {
        builder
            .add_iso(iso, None)
            .map_err(|source| CoreError::Assembly {
                context: "adding ISO",
                source,
            })?;
    }

    builder.set_hostname(&eff.hostname);
    if opts.memory_mib != 0 {
        builder.set_memory(opts.memory_mib);
    }

    for size in &opts.add_disks {
        builder
            .add_disk(Disk::from_size(size))
            .map_err(|source| CoreError::Assembly {
                context: "adding additional disk",
                source,
            })?;
    }

    if eff.cpu_count_host {
        builder.set_processors(PROCESSORS_HOST);
    }
    if eff.usernet {
        builder.enable_usermode_networking(vec![HostForwardPort::ssh()]);
    }

    // The SSH client owns the terminal in this mode
    builder.set_inherit_console(eff.mode != ExecutionMode::DevShellOverSsh);
    if let Some(path) = &opts.console_file {
        builder.set_console_file(path);
    }
    builder.append(opts.args.iter().cloned());

    match config {
        PreparedConfig::Rendered(conf) => {
            builder.set_config(conf).map_err(|source| CoreError::Assembly {
                context: "setting config",
                source,
            })?;
        }
        PreparedConfig::Direct(path) => {
            builder.set_config_file(path);
        }
    }

    tracing::debug!(
        mode = %eff.mode,
        hostname = %eff.hostname,
        mounts = bindings.len(),
        disks = opts.add_disks.len(),
        "Machine assembled"
    );
    Ok(builder)
}
