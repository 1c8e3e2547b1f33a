//! # qexec-core
//!
//! Launch orchestration for qexec.
//!
//! Turns a set of declarative launch options into a running machine and
//! sees it through to teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Orchestrator                       │
//! ├──────────────────────────────────────────────────────────┤
//! │  validate ──▶ resolve_bindings ──▶ prepare ──▶ assemble  │
//! │  (options)     (SRC,DEST)          (Conf)     (builder)  │
//! │                                                  │       │
//! │                                                  ▼       │
//! │  ┌────────────────┐  launch   ┌───────────────────────┐  │
//! │  │    Launcher    │──────────▶│   Box<dyn Instance>   │  │
//! │  └────────────────┘           └───────────────────────┘  │
//! │                                          │               │
//! │             drive(ExecutionMode) ◀───────┘               │
//! │             ├─ InteractiveConsole / DevShellConsole      │
//! │             ├─ SupervisedHeadless                        │
//! │             └─ DevShellOverSsh ──▶ DevShell::run         │
//! │                                                          │
//! │             destroy() on every path after launch         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use qexec_core::{LaunchOptions, Orchestrator, PlatformOptions, QemuLauncher, SshDevShell};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> qexec_core::Result<()> {
//! let opts = LaunchOptions {
//!     devshell: true,
//!     ..Default::default()
//! };
//! let platform = PlatformOptions {
//!     disk_image: Some("fedora-coreos.qcow2".into()),
//!     ..Default::default()
//! };
//!
//! let mut orchestrator = Orchestrator::new(QemuLauncher, SshDevShell::new("ssh", "core"));
//! orchestrator.run(&opts, &platform, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod assemble;
mod bind;
mod devshell;
mod driver;
mod error;
mod mode;
mod options;
mod prepare;
mod validate;

pub use assemble::{assemble, EffectiveOptions, WORKDIR_GUEST_PATH, WORKDIR_TMP_GUEST_PATH};
pub use bind::{parse_bind, resolve_bindings, MountBinding};
pub use devshell::{DevShell, SshDevShell};
pub use driver::{Launcher, Orchestrator, QemuLauncher, RunState};
pub use error::{CoreError, Result};
pub use mode::ExecutionMode;
pub use options::{
    LaunchOptions, Platform, PlatformOptions, DEFAULT_DEVSHELL_HOSTNAME, FRAGMENT_AUTOLOGIN,
};
pub use prepare::{apply_fragments, prepare, PreparedConfig};
pub use validate::validate;
