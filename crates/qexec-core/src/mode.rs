//! Post-launch execution modes.

use crate::options::LaunchOptions;
use std::fmt;

/// What the orchestrator does once the instance is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Attach to the serial console and wait for exit
    InteractiveConsole,
    /// Open an SSH session into the guest while supervising it
    DevShellOverSsh,
    /// Development shell on the serial console
    DevShellConsole,
    /// No terminal; fail on initramfs failures
    SupervisedHeadless,
}

impl ExecutionMode {
    /// Derive the mode from the user's options.
    pub fn from_options(opts: &LaunchOptions) -> Self {
        if opts.devshell_console {
            ExecutionMode::DevShellConsole
        } else if opts.devshell {
            ExecutionMode::DevShellOverSsh
        } else if opts.propagate_initramfs_failure {
            ExecutionMode::SupervisedHeadless
        } else {
            ExecutionMode::InteractiveConsole
        }
    }

    /// Whether the mode is a development shell.
    pub fn is_devshell(&self) -> bool {
        matches!(
            self,
            ExecutionMode::DevShellOverSsh | ExecutionMode::DevShellConsole
        )
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::InteractiveConsole => write!(f, "interactive-console"),
            ExecutionMode::DevShellOverSsh => write!(f, "devshell-ssh"),
            ExecutionMode::DevShellConsole => write!(f, "devshell-console"),
            ExecutionMode::SupervisedHeadless => write!(f, "supervised-headless"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_derivation() {
        let mode = |opts: LaunchOptions| ExecutionMode::from_options(&opts);

        assert_eq!(mode(LaunchOptions::default()), ExecutionMode::InteractiveConsole);
        assert_eq!(
            mode(LaunchOptions {
                propagate_initramfs_failure: true,
                ..Default::default()
            }),
            ExecutionMode::SupervisedHeadless
        );
        assert_eq!(
            mode(LaunchOptions {
                devshell: true,
                propagate_initramfs_failure: true,
                ..Default::default()
            }),
            ExecutionMode::DevShellOverSsh
        );
        assert_eq!(
            mode(LaunchOptions {
                devshell: true,
                devshell_console: true,
                ..Default::default()
            }),
            ExecutionMode::DevShellConsole
        );
    }

    #[test]
    fn test_is_devshell() {
        assert!(ExecutionMode::DevShellConsole.is_devshell());
        assert!(!ExecutionMode::SupervisedHeadless.is_devshell());
    }
}
