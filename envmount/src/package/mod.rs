//! Package model: resolved packages, environment locks and diffs.
//!
//! ```text
//! EnvironmentLock ──resolved_packages()──▶ PackageMap (filename → ResolvedPackage)
//!                                              │
//!                  EnvironmentDiff::between(installed, new)
//!                                              │
//!                         added / changed / removed / unchanged
//! ```

mod diff;
mod lock;
mod python;
mod resolved;

pub use diff::{
    render_package_list, DiffMarker, DiffRow, EnvironmentDiff, COLUMN_WIDTH, NOTHING_TO_DO,
};
pub use lock::{
    EnvironmentLock, LockError, LockResult, LockedMount, LockedPackage, ENVIRONMENT_IMAGE,
    ENVIRONMENT_PACKAGE,
};
pub use python::{python_version, ParsePythonVersionError, PythonVersion, PYTHON_PACKAGE};
pub use resolved::{
    package_map, BuildMetadata, ContentKind, PackageMap, ResolvedPackage, IMAGE_SUFFIXES,
    PIP_CHANNEL,
};
