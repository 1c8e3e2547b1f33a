//! First-boot configuration preparation.

use crate::assemble::EffectiveOptions;
use crate::bind::MountBinding;
use crate::error::{CoreError, Result};
use crate::options::{LaunchOptions, FRAGMENT_AUTOLOGIN};
use qexec_conf::{render, Conf, IgnitionVersion, Source};
use std::path::{Path, PathBuf};

/// The config handed to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedConfig {
    /// A rendered document
    Rendered(Conf),
    /// A file passed through unmodified
    Direct(PathBuf),
}

impl PreparedConfig {
    /// The rendered document, if any.
    pub fn conf(&self) -> Option<&Conf> {
        match self {
            PreparedConfig::Rendered(conf) => Some(conf),
            PreparedConfig::Direct(_) => None,
        }
    }

    /// Mutable access to the rendered document, if any.
    pub fn conf_mut(&mut self) -> Option<&mut Conf> {
        match self {
            PreparedConfig::Rendered(conf) => Some(conf),
            PreparedConfig::Direct(_) => None,
        }
    }
}

/// Produce the config for a launch.
///
/// In direct mode the ignition path is carried through. Otherwise the file
/// (or the empty template) is rendered, fragments are applied and every
/// binding is declared on the document.
///
/// # Errors
/// Returns an error if the file cannot be read or rendered, or a fragment
/// is unknown.
pub async fn prepare(
    opts: &LaunchOptions,
    eff: &EffectiveOptions,
    version: IgnitionVersion,
    bindings: &[MountBinding],
) -> Result<PreparedConfig> {
    if opts.direct_ignition {
        let path = opts.ignition_path().map(Path::to_path_buf).ok_or_else(|| {
            CoreError::OptionConflict(
                "cannot use --ignition-direct without a path to an Ignition config".into(),
            )
        })?;
        tracing::debug!(path = %path.display(), "Passing ignition config through");
        return Ok(PreparedConfig::Direct(path));
    }

    let mut conf = match opts.ignition_path() {
        None => render(&Source::Empty, version).map_err(|source| CoreError::ConfigRender {
            path: None,
            source,
        })?,
        Some(path) => {
            let contents = tokio::fs::read_to_string(path).await.map_err(|source| {
                CoreError::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            render(&Source::Ignition(contents), version).map_err(|source| {
                CoreError::ConfigRender {
                    path: Some(path.to_path_buf()),
                    source,
                }
            })?
        }
    };

    apply_fragments(&mut conf, &eff.fragments)?;

    for binding in bindings {
        conf.mount_9p(&binding.guest_path, binding.read_only);
    }

    tracing::debug!(
        version = %version,
        fragments = ?eff.fragments,
        mounts = bindings.len(),
        "Config prepared"
    );
    Ok(PreparedConfig::Rendered(conf))
}

/// Apply well-known fragments in order.
///
/// Stops at the first unknown name; earlier fragments stay applied.
///
/// # Errors
/// Returns [`CoreError::UnknownFragment`] for an unknown name.
pub fn apply_fragments(conf: &mut Conf, fragments: &[String]) -> Result<()> {
    for fragment in fragments {
        match fragment.as_str() {
            FRAGMENT_AUTOLOGIN => conf.add_autologin(),
            other => return Err(CoreError::UnknownFragment(other.to_string())),
        }
    }
    Ok(())
}
