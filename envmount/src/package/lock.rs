//! Environment lock files.
//!
//! A lock pins every package of a pre-built environment plus optional
//! mount-point archives that are unpacked before any package.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::resolved::{BuildMetadata, ContentKind, PackageMap, ResolvedPackage};

/// Filename of the packed whole-environment image.
pub const ENVIRONMENT_IMAGE: &str = "environment.sqshfs";

/// Package name and version given to [`ENVIRONMENT_IMAGE`].
pub const ENVIRONMENT_PACKAGE: (&str, &str) = ("conda_environment", "0.0.0");

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to read lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid lock file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// One locked package entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub build: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_stem: Option<String>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
}

/// An archive unpacked before the packages are installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedMount {
    pub name: String,
    pub filename: String,
}

/// Serialized description of a pre-built environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentLock {
    pub prefix: String,
    #[serde(default)]
    pub packages: Vec<LockedPackage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<LockedMount>,
}

impl EnvironmentLock {
    pub fn from_json(text: &str) -> LockResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> LockResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read and parse a lock file from disk.
    pub fn load(path: &Path) -> LockResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Convert the locked entries into resolved packages keyed by filename.
    ///
    /// The packed environment image becomes a single image package.
    pub fn resolved_packages(&self) -> PackageMap {
        self.packages
            .iter()
            .map(|locked| {
                let pkg = if locked.filename == ENVIRONMENT_IMAGE {
                    let (name, version) = ENVIRONMENT_PACKAGE;
                    let mut pkg = ResolvedPackage::new(name, version, ENVIRONMENT_IMAGE);
                    pkg.url = locked.url.clone();
                    pkg.kind = ContentKind::Image;
                    pkg
                } else {
                    let mut pkg = ResolvedPackage::new(
                        locked.name.clone(),
                        locked.version.clone(),
                        locked.filename.clone(),
                    )
                    .with_build(BuildMetadata {
                        build_string: Some(locked.build.clone()).filter(|b| !b.is_empty()),
                        channel: locked.channel.clone(),
                        subdir: locked.subdir.clone(),
                        depends: locked.depends.clone(),
                        ..Default::default()
                    });
                    pkg.url = locked.url.clone().filter(|u| !u.is_empty());
                    pkg
                };
                (pkg.filename.clone(), pkg)
            })
            .collect()
    }
}
