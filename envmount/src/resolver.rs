//! Dependency resolver seam.
//!
//! Solving is external; the bootstrapper only needs resolved package sets.

use thiserror::Error;

use crate::package::{PackageMap, PythonVersion};
use crate::BoxFuture;

/// Result type for resolver calls.
pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No package set satisfies the specs.
    #[error("unsatisfiable specs: {reason}")]
    Unsatisfiable { reason: String },

    /// Channel or index metadata could not be fetched.
    #[error("failed to fetch metadata from {channel}: {reason}")]
    Metadata { channel: String, reason: String },
}

/// Input to a native (conda) solve.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    /// Match specs such as `numpy>=2` or `python=3.13`.
    pub specs: Vec<String>,
    pub channels: Vec<String>,
    /// Target platform subdirs, e.g. `emscripten-wasm32`, `noarch`.
    pub platform_tags: Vec<String>,
    /// Currently installed packages; the solve may keep or replace them.
    pub installed: PackageMap,
}

impl SolveRequest {
    pub fn new(specs: Vec<String>) -> Self {
        Self {
            specs,
            ..Default::default()
        }
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_platform_tags(mut self, tags: Vec<String>) -> Self {
        self.platform_tags = tags;
        self
    }

    pub fn with_installed(mut self, installed: PackageMap) -> Self {
        self.installed = installed;
        self
    }
}

/// Solves specs into complete package sets.
pub trait Resolver: Send + Sync {
    /// Solve native specs. The result is the full new environment.
    fn solve<'a>(&'a self, request: SolveRequest) -> BoxFuture<'a, ResolveResult<PackageMap>>;

    /// Solve Python index specs against the native set. The result holds
    /// only the additional wheels.
    fn solve_pip<'a>(
        &'a self,
        specs: &'a [String],
        native: &'a PackageMap,
        python_version: PythonVersion,
    ) -> BoxFuture<'a, ResolveResult<PackageMap>>;
}
