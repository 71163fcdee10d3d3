//! Resolved package identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Filename suffixes of read-only filesystem images.
pub const IMAGE_SUFFIXES: [&str; 2] = [".sqshfs", ".squashfs"];

/// Channel name used for packages resolved from the Python package index.
pub const PIP_CHANNEL: &str = "PyPi";

/// How a package's content is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// An archive that is downloaded and extracted.
    Archive,
    /// A filesystem image that is mounted and streamed.
    Image,
}

impl ContentKind {
    /// Infer the content kind from a package filename.
    pub fn from_filename(filename: &str) -> Self {
        if IMAGE_SUFFIXES.iter().any(|s| filename.ends_with(s)) {
            Self::Image
        } else {
            Self::Archive
        }
    }
}

/// Build details carried through from the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,

    /// Channel (repository) name, e.g. `conda-forge` or `PyPi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    #[serde(default)]
    pub depends: Vec<String>,

    /// Load every shared library of this package with global visibility.
    #[serde(default)]
    pub shared_library: bool,
}

/// A package selected by the resolver, ready to install.
///
/// Identity is the filename. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub filename: String,

    /// Content location; defaults to `<pkg_root_url>/<filename>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub kind: ContentKind,

    #[serde(default)]
    pub build: BuildMetadata,
}

impl ResolvedPackage {
    /// Create a package; the content kind is inferred from the filename.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        Self {
            name: name.into(),
            version: version.into(),
            kind: ContentKind::from_filename(&filename),
            filename,
            url: None,
            build: BuildMetadata::default(),
        }
    }

    /// Set the content URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the build string.
    pub fn with_build_string(mut self, build: impl Into<String>) -> Self {
        self.build.build_string = Some(build.into());
        self
    }

    /// Set the channel name.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.build.channel = Some(channel.into());
        self
    }

    /// Replace all build metadata.
    pub fn with_build(mut self, build: BuildMetadata) -> Self {
        self.build = build;
        self
    }

    /// Force global visibility for this package's libraries.
    pub fn with_shared_library(mut self, shared: bool) -> Self {
        self.build.shared_library = shared;
        self
    }

    /// Content URL, falling back to `<pkg_root_url>/<filename>`.
    pub fn resolve_url(&self, pkg_root_url: &str) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("{}/{}", pkg_root_url.trim_end_matches('/'), self.filename),
        }
    }

    /// `name-version-build`, the key used to find manifest entries when
    /// the filename is not known.
    pub fn identity(&self) -> String {
        format!(
            "{}-{}-{}",
            self.name,
            self.version,
            self.build.build_string.as_deref().unwrap_or_default()
        )
    }

    /// Whether the content is a Python wheel.
    pub fn is_wheel(&self) -> bool {
        self.filename.ends_with(".whl")
            || self.url.as_deref().is_some_and(|u| u.ends_with(".whl"))
    }

    /// Whether the package came from the Python package index.
    pub fn is_pip(&self) -> bool {
        self.build.channel.as_deref() == Some(PIP_CHANNEL)
    }
}

impl fmt::Display for ResolvedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        if let Some(build) = &self.build.build_string {
            write!(f, " ({})", build)?;
        }
        Ok(())
    }
}

/// Resolved packages keyed by filename.
pub type PackageMap = BTreeMap<String, ResolvedPackage>;

/// Build a [`PackageMap`] from a list of packages.
pub fn package_map(packages: impl IntoIterator<Item = ResolvedPackage>) -> PackageMap {
    packages
        .into_iter()
        .map(|p| (p.filename.clone(), p))
        .collect()
}
