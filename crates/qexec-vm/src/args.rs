//! QEMU command line rendering.
//!
//! Everything here is pure: [`qemu_args`] maps a [`MachineSpec`] plus the
//! paths resolved at launch time onto an argv, so it can be tested without
//! spawning anything.

use crate::config::{Disk, DiskChannel, HostForwardPort, MachineSpec, NATIVE_4K_SECTOR_SIZE};
use std::path::PathBuf;

/// fw_cfg key Ignition reads its config from on QEMU.
pub const FW_CFG_CONFIG_KEY: &str = "opt/com.coreos/config";

/// virtio-serial port the initramfs dumps its journal to on failure.
pub const JOURNAL_PORT_NAME: &str = "com.coreos.ignition.journal";

const OVMF_CODE: &str = "/usr/share/OVMF/OVMF_CODE.fd";
const OVMF_CODE_SECURE: &str = "/usr/share/OVMF/OVMF_CODE.secboot.fd";

/// A disk after its backing storage has been prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDisk {
    /// Drive id, unique per instance
    pub id: String,
    /// What QEMU opens: an overlay path or an `nbd:` URI
    pub file: String,
    /// Image format of `file`
    pub format: &'static str,
    /// The disk as requested
    pub disk: Disk,
    /// Boot from this disk
    pub boot: bool,
}

/// Paths and values resolved while launching an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchLayout {
    /// Boot disk first, then additional disks in order
    pub disks: Vec<ResolvedDisk>,
    /// Config file handed over fw_cfg, if any
    pub config_path: Option<PathBuf>,
    /// File capturing the initramfs journal port
    pub journal_path: PathBuf,
    /// Forwards with ephemeral host ports filled in
    pub forwards: Vec<HostForwardPort>,
    /// Concrete vCPU count
    pub cpus: u32,
}

/// Render the full QEMU argv (without the binary itself).
pub fn qemu_args(spec: &MachineSpec, layout: &LaunchLayout) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-machine", "accel=kvm:tcg"]);
    push(&["-m", &spec.memory_mib.to_string()]);
    push(&["-smp", &layout.cpus.to_string()]);
    push(&["-display", "none"]);

    match spec.firmware.as_str() {
        "" | "bios" => {}
        "uefi" => push(&["-drive", &pflash(OVMF_CODE)]),
        "uefi-secure" => push(&["-drive", &pflash(OVMF_CODE_SECURE)]),
        path => push(&["-bios", path]),
    }

    match (&spec.console_file, spec.inherit_console) {
        (Some(path), _) => {
            let chardev = format!("file,id=console,path={}", path.display());
            push(&["-chardev", &chardev, "-serial", "chardev:console"]);
        }
        (None, true) => push(&["-serial", "mon:stdio"]),
        (None, false) => push(&["-serial", "null"]),
    }

    let journal = format!("file,id=ignition-journal,path={}", layout.journal_path.display());
    let port = format!("virtserialport,chardev=ignition-journal,name={JOURNAL_PORT_NAME}");
    push(&["-device", "virtio-serial", "-chardev", &journal, "-device", &port]);

    for disk in &layout.disks {
        args.extend(disk_args(disk));
    }

    for (i, iso) in spec.isos.iter().enumerate() {
        let id = format!("cd{i}");
        let drive = format!(
            "if=none,id={id},media=cdrom,readonly=on,format=raw,file={}",
            iso.path.display()
        );
        let mut device = format!("ide-cd,drive={id}");
        if let Some(label) = &iso.label {
            device.push_str(&format!(",serial={label}"));
        }
        if spec.boot_disk.is_none() && i == 0 {
            device.push_str(",bootindex=1");
        }
        args.extend(["-drive".to_string(), drive, "-device".to_string(), device]);
    }

    for (i, mount) in spec.mounts.iter().enumerate() {
        let mut virtfs = format!(
            "local,id=fs{i},path={},security_model=mapped,mount_tag={}",
            mount.host_path.display(),
            mount.tag()
        );
        if mount.read_only {
            virtfs.push_str(",readonly=on");
        }
        args.extend(["-virtfs".to_string(), virtfs]);
    }

    match &spec.usermode_forwards {
        Some(_) => {
            let mut netdev = String::from("user,id=eth0");
            if !spec.hostname.is_empty() {
                netdev.push_str(&format!(",hostname={}", spec.hostname));
            }
            for fwd in &layout.forwards {
                netdev.push_str(&format!(
                    ",hostfwd=tcp:127.0.0.1:{}-:{}",
                    fwd.host_port, fwd.guest_port
                ));
            }
            args.extend([
                "-netdev".to_string(),
                netdev,
                "-device".to_string(),
                "virtio-net-pci,netdev=eth0".to_string(),
            ]);
        }
        None => args.extend(["-nic".to_string(), "none".to_string()]),
    }

    if let Some(path) = &layout.config_path {
        args.extend([
            "-fw_cfg".to_string(),
            format!("name={FW_CFG_CONFIG_KEY},file={}", path.display()),
        ]);
    }

    args.extend(spec.extra_args.iter().cloned());
    args
}

fn pflash(code: &str) -> String {
    format!("if=pflash,format=raw,unit=0,readonly=on,file={code}")
}

fn block_size_opts(disk: &Disk) -> String {
    if disk.sector_size == NATIVE_4K_SECTOR_SIZE {
        format!(",physical_block_size={0},logical_block_size={0}", disk.sector_size)
    } else {
        String::new()
    }
}

fn disk_args(resolved: &ResolvedDisk) -> Vec<String> {
    let id = &resolved.id;
    let disk = &resolved.disk;
    let bootindex = if resolved.boot { ",bootindex=1" } else { "" };
    let blocks = block_size_opts(disk);
    let mut args = Vec::new();

    if disk.multipath {
        // Two SCSI paths to the same image; locking is off so both can open it
        for path in 0..2 {
            let drive_id = format!("{id}-path{path}");
            let bus = format!("scsi-{drive_id}");
            let boot = if path == 0 { bootindex } else { "" };
            args.extend([
                "-drive".to_string(),
                format!(
                    "if=none,id={drive_id},format={},file={},file.locking=off,cache=unsafe",
                    resolved.format, resolved.file
                ),
                "-device".to_string(),
                format!("virtio-scsi-pci,id={bus}"),
                "-device".to_string(),
                format!(
                    "scsi-hd,bus={bus}.0,drive={drive_id},vendor=NVME,product=VirtualMultipath,wwn=1{boot}{blocks}"
                ),
            ]);
        }
        return args;
    }

    let device = match disk.channel {
        DiskChannel::Virtio => "virtio-blk-pci",
        DiskChannel::Nvme => "nvme",
    };
    args.extend([
        "-drive".to_string(),
        format!(
            "if=none,id={id},format={},file={},cache=unsafe",
            resolved.format, resolved.file
        ),
        "-device".to_string(),
        format!("{device},drive={id},serial={id}{bootindex}{blocks}"),
    ]);
    args
}
