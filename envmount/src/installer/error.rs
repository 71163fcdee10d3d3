//! Installer error types.

use thiserror::Error;

use crate::mount::MountError;
use crate::vfs::VfsError;

/// Result type for installer operations.
pub type InstallResult<T> = Result<T, InstallError>;

/// Errors raised while installing or removing packages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    /// A wheel was requested but no interpreter version is known.
    #[error("cannot install wheel {package}: no Python interpreter in the environment")]
    PythonRequired { package: String },

    /// Two packages disagree on whether a path is a file or a directory,
    /// or an image file would replace an existing file.
    #[error("path collision at {path} while installing {package}")]
    PathCollision { path: String, package: String },

    /// No manifest entry matches a package being removed.
    #[error("no installed paths recorded for {package}")]
    ManifestMissing { package: String },

    /// The package payload is malformed.
    #[error("invalid package {filename}: {reason}")]
    InvalidPackage { filename: String, reason: String },

    /// The extractor could not download or unpack the content.
    #[error("failed to extract {source_name}: {reason}")]
    Extract { source_name: String, reason: String },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("filesystem error: {0}")]
    Fs(#[from] VfsError),
}
