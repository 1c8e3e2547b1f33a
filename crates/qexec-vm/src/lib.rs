//! # qexec-vm
//!
//! QEMU machine layer for qexec.
//! Describes a machine with [`QemuBuilder`], launches it as a supervised
//! process and hands back an [`Instance`] that can be waited on and destroyed.
//!
//! ## Quick Start
//!
//! ```no_run
//! use qexec_vm::{Disk, Instance, QemuBuilder};
//!
//! # async fn example() -> qexec_vm::Result<()> {
//! let mut builder = QemuBuilder::new();
//! builder
//!     .add_boot_disk(Disk {
//!         backing_file: Some("/var/lib/images/fedora-coreos.qcow2".into()),
//!         ..Default::default()
//!     })?
//!     .set_memory(2048);
//!
//! let mut instance = builder.launch().await?;
//! let result = instance.wait().await;
//!
//! // Always release the instance, whatever the outcome
//! instance.destroy().await;
//! result
//! # }
//! ```
//!
//! ## Features
//!
//! - **Disks**: copy-on-write overlays, blank disks, NVMe, native 4k, multipath, NBD
//! - **First-boot config**: passed over fw_cfg or injected into the boot partition
//! - **Kernel arguments**: appended to the boot entries before first boot
//! - **9p shares**: host directories exported to the guest
//! - **Boot failure detection**: initramfs journal captured over virtio-serial

mod args;
mod builder;
mod config;
mod disk;
mod error;
mod inject;
mod instance;
mod watch;

pub use args::{qemu_args, LaunchLayout, ResolvedDisk, FW_CFG_CONFIG_KEY, JOURNAL_PORT_NAME};
pub use builder::QemuBuilder;
pub use config::{
    parse_size, ConfigSource, Disk, DiskChannel, HostForwardPort, Iso, MachineSpec, Mount9p,
    NATIVE_4K_SECTOR_SIZE, PROCESSORS_HOST,
};
pub use error::{Result, VmError};
pub use instance::{Instance, InstanceState, QemuInstance};
