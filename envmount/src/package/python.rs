//! Interpreter version discovery.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::resolved::ResolvedPackage;

/// Name of the interpreter package.
pub const PYTHON_PACKAGE: &str = "python";

/// `major.minor` of the interpreter in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

/// A version string without a numeric `major.minor` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Python version: {0:?}")]
pub struct ParsePythonVersionError(pub String);

impl PythonVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Site-packages directory relative to the prefix.
    pub fn site_packages(&self) -> String {
        format!("lib/python{}.{}/site-packages", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = ParsePythonVersionError;

    /// Parse `3.13` or a full version such as `3.13.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParsePythonVersionError(s.to_string());
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version of the `python` package in `packages`, if present and parseable.
pub fn python_version<'a>(
    packages: impl IntoIterator<Item = &'a ResolvedPackage>,
) -> Option<PythonVersion> {
    packages
        .into_iter()
        .find(|p| p.name == PYTHON_PACKAGE)
        .and_then(|p| p.version.parse().ok())
}
