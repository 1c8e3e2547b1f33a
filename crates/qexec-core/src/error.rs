//! Error types for qexec-core.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for qexec-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while preparing, launching or driving an instance.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two options that cannot be combined, or a required one is missing
    #[error("{0}")]
    OptionConflict(String),

    /// The ignition file could not be read
    #[error("reading {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ignition document could not be rendered
    #[error("parsing {}: {source}", config_label(path.as_deref()))]
    ConfigRender {
        /// File path, `None` for the empty template
        path: Option<PathBuf>,
        #[source]
        source: qexec_conf::ConfError,
    },

    /// A fragment name that is not known
    #[error("rendering fragments: unknown fragment: {0}")]
    UnknownFragment(String),

    /// A bind option without both halves
    #[error("malformed bind option, required: SRC,DEST (got {0:?})")]
    MalformedBindSpec(String),

    /// The machine description was rejected while it was being assembled
    #[error("{context}: {source}")]
    Assembly {
        context: &'static str,
        #[source]
        source: qexec_vm::VmError,
    },

    /// The instance could not be started
    #[error("launching instance: {0}")]
    Launch(#[source] qexec_vm::VmError),

    /// The instance failed after it started
    #[error("instance failed: {0}")]
    Runtime(#[source] qexec_vm::VmError),

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// The development shell session failed
    #[error("devshell: {0}")]
    DevShell(String),
}

/// Name a rendered config in messages.
fn config_label(path: Option<&Path>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<empty>".to_string(),
    }
}

impl CoreError {
    /// Whether the error comes from the options or config, before any launch.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            CoreError::OptionConflict(_)
                | CoreError::ConfigRead { .. }
                | CoreError::ConfigRender { .. }
                | CoreError::UnknownFragment(_)
                | CoreError::MalformedBindSpec(_)
                | CoreError::Assembly { .. }
        )
    }

    /// Map a failure of a started instance, keeping cancellation distinct.
    pub(crate) fn runtime(err: qexec_vm::VmError) -> Self {
        match err {
            qexec_vm::VmError::Cancelled => CoreError::Cancelled,
            other => CoreError::Runtime(other),
        }
    }
}
