//! Error types for qexec-conf.

use thiserror::Error;

/// Result type alias for qexec-conf operations.
pub type Result<T> = std::result::Result<T, ConfError>;

/// Errors that can occur while rendering a first-boot configuration.
#[derive(Debug, Error)]
pub enum ConfError {
    /// The source is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The source is JSON but not an Ignition document
    #[error("not an Ignition config: {0}")]
    Malformed(String),

    /// The document declares a schema version we cannot render
    #[error("unsupported Ignition version {found}")]
    UnsupportedVersion {
        /// Version string found in the document
        found: String,
    },

    /// The document's major version differs from the requested one
    #[error("config is Ignition {found}, but spec {expected} was requested")]
    VersionMismatch {
        /// Version string found in the document
        found: String,
        /// Version the caller asked for
        expected: String,
    },
}
