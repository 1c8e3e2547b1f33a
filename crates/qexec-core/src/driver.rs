//! Launch orchestration and execution mode driving.
//!
//! [`Orchestrator::run`] validates, prepares and assembles everything before
//! launching, drives the instance in its [`ExecutionMode`] and always
//! destroys the instance before returning.

use crate::assemble::{assemble, EffectiveOptions};
use crate::bind::resolve_bindings;
use crate::devshell::DevShell;
use crate::error::{CoreError, Result};
use crate::mode::ExecutionMode;
use crate::options::{LaunchOptions, PlatformOptions};
use crate::prepare::prepare;
use crate::validate::validate;
use async_trait::async_trait;
use qexec_vm::{Instance, QemuBuilder};
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Starts instances from a populated builder.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, builder: QemuBuilder) -> qexec_vm::Result<Box<dyn Instance>>;
}

/// Launches instances under QEMU.
#[derive(Debug, Clone, Copy, Default)]
pub struct QemuLauncher;

#[async_trait]
impl Launcher for QemuLauncher {
    async fn launch(&self, builder: QemuBuilder) -> qexec_vm::Result<Box<dyn Instance>> {
        Ok(Box::new(builder.launch().await?))
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Launched,
    RunningInteractive,
    RunningSupervised,
    RunningDevShell,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Launched => write!(f, "launched"),
            RunState::RunningInteractive => write!(f, "running-interactive"),
            RunState::RunningSupervised => write!(f, "running-supervised"),
            RunState::RunningDevShell => write!(f, "running-devshell"),
            RunState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Drives one launch from options to teardown.
pub struct Orchestrator<L, D> {
    launcher: L,
    devshell: D,
}

impl<L: Launcher, D: DevShell> Orchestrator<L, D> {
    pub fn new(launcher: L, devshell: D) -> Self {
        Self { launcher, devshell }
    }

    /// Run one launch to completion.
    ///
    /// `cancel` governs the whole run. It is cancelled here on any error
    /// before launch and when a development shell session ends.
    ///
    /// # Errors
    /// Option, config and assembly errors are returned before anything is
    /// launched. Failures after launch are returned once the instance has
    /// been destroyed.
    pub async fn run(
        &mut self,
        opts: &LaunchOptions,
        platform: &PlatformOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mode, builder) = match self.stage(opts, platform).await {
            Ok(staged) => staged,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        let start = Instant::now();
        let mut instance = self.launcher.launch(builder).await.map_err(|e| {
            cancel.cancel();
            CoreError::Launch(e)
        })?;
        let id = instance.id();
        log_transition(&id, mode, RunState::Launched);

        let result = self.drive(mode, instance.as_mut(), cancel).await;

        instance.destroy().await;
        log_transition(&id, mode, RunState::Terminated);
        tracing::info!(
            instance_id = %id,
            %mode,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Run finished"
        );
        result
    }

    /// Everything that happens before launch.
    async fn stage(
        &mut self,
        opts: &LaunchOptions,
        platform: &PlatformOptions,
    ) -> Result<(ExecutionMode, QemuBuilder)> {
        validate(opts, platform)?;

        let eff = EffectiveOptions::derive(opts, platform);
        let bindings = resolve_bindings(&eff.bind_ro, &eff.bind_rw)?;
        let mut config = prepare(opts, &eff, platform.ignition_version, &bindings).await?;

        if eff.mode == ExecutionMode::DevShellOverSsh {
            if let Some(conf) = config.conf_mut() {
                self.devshell.prepare(conf).await?;
            }
        }

        let builder = assemble(opts, &eff, platform, &bindings, &config)?;
        tracing::info!(mode = %eff.mode, platform = %platform.platform, "Launching instance");
        Ok((eff.mode, builder))
    }

    async fn drive(
        &self,
        mode: ExecutionMode,
        instance: &mut dyn Instance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = instance.id();
        match mode {
            ExecutionMode::InteractiveConsole | ExecutionMode::DevShellConsole => {
                log_transition(&id, mode, RunState::RunningInteractive);
                tokio::select! {
                    _ = cancel.cancelled() => Err(CoreError::Cancelled),
                    result = instance.wait() => result.map_err(CoreError::runtime),
                }
            }
            ExecutionMode::SupervisedHeadless => {
                log_transition(&id, mode, RunState::RunningSupervised);
                instance.wait_all(cancel).await.map_err(CoreError::runtime)
            }
            ExecutionMode::DevShellOverSsh => {
                log_transition(&id, mode, RunState::RunningDevShell);
                let addr = instance.ssh_address().ok_or_else(|| {
                    CoreError::DevShell("instance has no SSH port forward".into())
                })?;
                tracing::info!(instance_id = %id, %addr, "Connecting devshell");

                tokio::select! {
                    result = self.devshell.run(addr, cancel) => {
                        cancel.cancel();
                        result
                    }
                    result = instance.wait_all(cancel) => {
                        result.map_err(CoreError::runtime)
                    }
                }
            }
        }
    }
}

fn log_transition(id: &uuid::Uuid, mode: ExecutionMode, state: RunState) {
    tracing::info!(instance_id = %id, %mode, %state, "Run state changed");
}
