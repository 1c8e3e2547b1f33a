//! qexec entry point.
//!
//! Parses flags, loads host configuration from the environment, and hands a
//! single launch to the orchestrator. Logs go to stderr so the guest console
//! keeps stdout.
//!
//! ## Exit codes
//!
//! - `0`: the machine ran and exited cleanly
//! - `1`: the machine failed to start or failed while running
//! - `2`: the options or the config were rejected before launch
//! - `130`: interrupted

mod cli;
mod config;

use clap::Parser;
use cli::Cli;
use config::QexecConfig;
use qexec_core::{CoreError, Orchestrator, QemuLauncher, SshDevShell};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

const DEFAULT_LOG_FILTER: &str = "qexec=info,qexec_core=info,qexec_vm=info,qemu=info";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        DEFAULT_LOG_FILTER
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("QEXEC_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = QexecConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    config.validate_warn();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            signal_cancel.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(
        QemuLauncher,
        SshDevShell::new(config.ssh_path.clone(), config.ssh_user.clone()),
    );
    let (opts, platform) = cli.into_options(&config);

    let result = orchestrator.run(&opts, &platform, &cancel).await;
    let code = exit_code(&result);
    if let Err(e) = result {
        eprintln!("error: {:#}", anyhow::Error::new(e));
    }
    ExitCode::from(code)
}

fn exit_code(result: &Result<(), CoreError>) -> u8 {
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(CoreError::Cancelled) => EXIT_CANCELLED,
        Err(e) if e.is_usage_error() => EXIT_USAGE,
        Err(_) => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), EXIT_SUCCESS);
        assert_eq!(exit_code(&Err(CoreError::Cancelled)), EXIT_CANCELLED);
        assert_eq!(
            exit_code(&Err(CoreError::OptionConflict(
                "cannot use console devshell and --console-to-file".into()
            ))),
            EXIT_USAGE
        );
        assert_eq!(
            exit_code(&Err(CoreError::MalformedBindSpec("/srv".into()))),
            EXIT_USAGE
        );
        assert_eq!(
            exit_code(&Err(CoreError::ConfigRead {
                path: PathBuf::from("/nonexistent.ign"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })),
            EXIT_USAGE
        );
        assert_eq!(
            exit_code(&Err(CoreError::DevShell("ssh exited with 1".into()))),
            EXIT_FAILURE
        );
    }
}
