//! Error types shared by every vhdkit crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout vhdkit.
pub type VhdkitResult<T> = Result<T, VhdkitError>;

/// Errors surfaced by disk creation and archive introspection.
///
/// Fallbacks documented on the metadata accessors (flags, architecture,
/// version, name lookup) never produce one of these; everything else
/// propagates to the caller unmodified.
#[derive(Debug, Error)]
pub enum VhdkitError {
    /// A caller-supplied argument was rejected before any backend call.
    #[error("invalid argument '{name}': {reason}")]
    ArgumentInvalid { name: &'static str, reason: String },

    /// A required file does not exist.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A 1-based image index fell outside `[1, count]`.
    #[error("image index {index} out of range (image count: {count})")]
    IndexOutOfRange { index: u32, count: u32 },

    /// Operation on a closed or invalid handle.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The default security descriptor could not be initialized.
    #[error("unable to initialize the security descriptor for the virtual disk")]
    SecurityInitFailed,

    /// A backend call reported a failure status.
    #[error("{operation} failed with status {code:#010x}")]
    Backend { operation: &'static str, code: u32 },

    /// The metadata document is malformed or lacks a required field.
    #[error("metadata parse failure: {0}")]
    ParseFailure(String),

    /// Filesystem error (e.g. deleting an existing disk before overwrite).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Options could not be loaded or are inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl VhdkitError {
    /// Shorthand for [`VhdkitError::ArgumentInvalid`].
    pub fn argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::ArgumentInvalid {
            name,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`VhdkitError::Backend`].
    pub fn backend(operation: &'static str, code: u32) -> Self {
        Self::Backend { operation, code }
    }

    /// Backend status code carried by this error, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}
