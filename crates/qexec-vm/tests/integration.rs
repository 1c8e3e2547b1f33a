//! Integration tests for qexec-vm.
//!
//! These tests require:
//! - Linux with /dev/kvm access (TCG works, slowly)
//! - qemu-system-x86_64 and qemu-img installed
//! - A Fedora CoreOS qcow2 image
//!
//! Run with: `cargo test -p qexec-vm -- --ignored`

use qexec_conf::{render, IgnitionVersion, Source};
use qexec_vm::{Disk, HostForwardPort, Instance, InstanceState, QemuBuilder, VmError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn image_path() -> Option<PathBuf> {
    let path = std::env::var("QEXEC_TEST_IMAGE")
        .unwrap_or_else(|_| "/var/lib/qexec/fedora-coreos.qcow2".to_string());
    if Path::new(&path).exists() {
        Some(PathBuf::from(path))
    } else {
        eprintln!("Skipping test: image not found");
        eprintln!("Set QEXEC_TEST_IMAGE to a Fedora CoreOS qcow2 image");
        None
    }
}

fn boot_disk(image: PathBuf) -> Disk {
    Disk {
        backing_file: Some(image),
        ..Default::default()
    }
}

/// Launch, cancel the supervised wait, destroy
#[tokio::test]
#[ignore = "requires QEMU + a CoreOS image"]
async fn test_instance_lifecycle() {
    let Some(image) = image_path() else { return };
    let state = tempfile::tempdir().unwrap();

    let conf = render(&Source::Empty, IgnitionVersion::V3).unwrap();
    let mut builder = QemuBuilder::from_spec(qexec_vm::MachineSpec {
        state_dir: state.path().to_path_buf(),
        ..Default::default()
    });
    builder
        .add_boot_disk(boot_disk(image))
        .unwrap()
        .set_config(&conf)
        .unwrap()
        .enable_usermode_networking(vec![HostForwardPort::ssh()]);

    let mut instance = builder.launch().await.expect("Failed to launch instance");
    assert_eq!(instance.state(), InstanceState::Running);
    assert!(!instance.id().is_nil());
    assert!(instance.ssh_address().is_some());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let err = instance.wait_all(&cancel).await.unwrap_err();
    assert!(matches!(err, VmError::Cancelled));

    instance.destroy().await;
    assert_eq!(instance.state(), InstanceState::Destroyed);
    assert!(std::fs::read_dir(state.path()).unwrap().next().is_none());
}

/// A broken config fails in the initramfs and is reported as a boot failure
#[tokio::test]
#[ignore = "requires QEMU + a CoreOS image"]
async fn test_initramfs_failure_detected() {
    let Some(image) = image_path() else { return };
    let state = tempfile::tempdir().unwrap();

    // Points at a config URL that cannot be fetched
    let broken = r#"{"ignition":{"version":"3.0.0","config":{"merge":[{"source":"http://127.0.0.1:1/missing.ign"}]}}}"#;
    let conf = render(&Source::Ignition(broken.into()), IgnitionVersion::V3).unwrap();

    let mut builder = QemuBuilder::from_spec(qexec_vm::MachineSpec {
        state_dir: state.path().to_path_buf(),
        ..Default::default()
    });
    builder
        .add_boot_disk(boot_disk(image))
        .unwrap()
        .set_config(&conf)
        .unwrap();

    let mut instance = builder.launch().await.expect("Failed to launch instance");
    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(600), instance.wait_all(&cancel)).await;
    instance.destroy().await;

    let err = result.expect("boot did not fail in time").unwrap_err();
    assert!(matches!(err, VmError::BootFailure(_)));
}

/// Extra blank disks are created and attached
#[tokio::test]
#[ignore = "requires QEMU + a CoreOS image"]
async fn test_additional_disk() {
    let Some(image) = image_path() else { return };
    let state = tempfile::tempdir().unwrap();

    let mut builder = QemuBuilder::from_spec(qexec_vm::MachineSpec {
        state_dir: state.path().to_path_buf(),
        ..Default::default()
    });
    builder
        .add_boot_disk(boot_disk(image))
        .unwrap()
        .add_disk(Disk::from_size("1G"))
        .unwrap();

    let mut instance = builder.launch().await.expect("Failed to launch instance");
    assert_eq!(instance.layout().disks.len(), 2);
    assert!(instance.state_dir().join("disk1.qcow2").exists());
    instance.destroy().await;
}
