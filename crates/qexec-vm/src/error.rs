//! Error types for qexec-vm.

use thiserror::Error;

/// Result type alias for qexec-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while building, launching or supervising a machine.
#[derive(Debug, Error)]
pub enum VmError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to prepare instance resources (state dir, disks, helpers)
    #[error("failed to create instance: {0}")]
    Create(String),

    /// Failed to start the QEMU process
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Failed to inject first-boot data into the boot disk
    #[error("config injection failed: {0}")]
    Inject(String),

    /// QEMU exited unsuccessfully
    #[error("qemu exited unsuccessfully: {0}")]
    Exited(String),

    /// The guest reported a failure before reaching the real root
    #[error("boot failed in initramfs: {0}")]
    BootFailure(String),

    /// The wait was cancelled before the instance finished
    #[error("wait cancelled")]
    Cancelled,

    /// Instance is not in expected state
    #[error("invalid instance state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// First-boot config could not be serialized
    #[error("config error: {0}")]
    Conf(#[from] qexec_conf::ConfError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
