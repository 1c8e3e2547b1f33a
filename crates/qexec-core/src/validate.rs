//! Option validation.
//!
//! Runs before anything touches the filesystem or spawns a process.

use crate::error::{CoreError, Result};
use crate::options::{LaunchOptions, Platform, PlatformOptions};

/// Reject option combinations that cannot work together.
///
/// Rules are checked in a fixed order and the first violation is returned.
///
/// # Errors
/// Returns [`CoreError::OptionConflict`] naming the conflicting options.
pub fn validate(opts: &LaunchOptions, platform: &PlatformOptions) -> Result<()> {
    let conflict = |msg: &str| Err(CoreError::OptionConflict(msg.to_string()));

    if opts.devshell_console && opts.console_file.is_some() {
        return conflict("cannot use --devshell-console together with --console-to-file");
    }

    if opts.wants_devshell() {
        if opts.direct_ignition {
            return conflict("cannot use --devshell with --ignition-direct");
        }
        if platform.disk_image.is_none() && platform.platform == Platform::Qemu {
            return conflict("no disk image provided, --devshell needs --qemu-image");
        }
    }

    if opts.direct_ignition {
        if opts.ignition_path().is_none() {
            return conflict("cannot use --ignition-direct without a path to an Ignition config");
        }
        if !opts.fragments.is_empty() {
            return conflict("cannot use --add-ignition fragments with --ignition-direct");
        }
        if !opts.bind_ro.is_empty() || !opts.bind_rw.is_empty() {
            return conflict("cannot use --bind-ro/--bind-rw mounts with --ignition-direct");
        }
    }

    Ok(())
}
