//! Load order and symbol visibility for installed shared libraries.
//!
//! A library is loaded with global visibility when another library may
//! resolve symbols against it:
//!
//! 1. its package is marked as a shared library,
//! 2. its file name appears in any library's needed list,
//! 3. it lives directly in `<prefix>/lib`, or
//! 4. it lives in the package's private `<site-packages>/<name>.libs` dir.
//!
//! Global libraries load first; ties keep inventory order.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::dylink::parse_dylink;
use crate::installer::SharedLibraryInventory;
use crate::package::{PythonVersion, ResolvedPackage};
use crate::vfs::{file_name, join, normalize, parent, VirtualFs};
use crate::BoxFuture;

/// Errors reported by a [`DynamicLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("library not found: {path}")]
    NotFound { path: String },

    #[error("failed to load {path}: {reason}")]
    Failed { path: String, reason: String },
}

/// Options for one load call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Directories searched for the library's own dependencies, in order.
    pub search_paths: Vec<String>,
    /// Make the library's symbols available to later loads.
    pub global: bool,
    /// Load again even if already loaded.
    pub force_reload: bool,
}

/// The host's load-library primitive.
pub trait DynamicLoader: Send + Sync {
    fn load_library<'a>(&'a self, path: &'a str, options: LoadOptions) -> BoxFuture<'a, Result<(), LoadError>>;
}

/// One library in a load plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLibrary {
    pub package: String,
    pub path: String,
    pub global: bool,
    pub search_paths: Vec<String>,
}

/// Outcome of [`LibraryLoadPlanner::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<PlannedLibrary>,
    pub failed: Vec<(PlannedLibrary, LoadError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Stable-sort `plan` so every global library precedes every local one.
pub fn order_globals_first(plan: &mut [PlannedLibrary]) {
    plan.sort_by_key(|lib| !lib.global);
}

/// Computes and executes library load plans for one prefix.
pub struct LibraryLoadPlanner {
    fs: Arc<dyn VirtualFs>,
    prefix: String,
    site_packages: Option<String>,
}

impl LibraryLoadPlanner {
    /// Create a planner. Without an interpreter version there is no
    /// site-packages directory and no private library dirs.
    pub fn new(fs: Arc<dyn VirtualFs>, prefix: &str, python: Option<PythonVersion>) -> Self {
        let prefix = normalize(prefix);
        let site_packages = python.map(|v| join(&prefix, &v.site_packages()));
        Self {
            fs,
            prefix,
            site_packages,
        }
    }

    fn shared_lib_dir(&self) -> String {
        join(&self.prefix, "lib")
    }

    /// `<site-packages>/<name>.libs` for `package`.
    pub fn private_lib_dir(&self, package: &str) -> Option<String> {
        self.site_packages
            .as_ref()
            .map(|site| join(site, &format!("{}.libs", package.replace('-', "_"))))
    }

    /// Union of the needed lists of every library outside forced-global
    /// packages. Unreadable or malformed libraries contribute nothing.
    async fn needed_libraries(
        &self,
        inventory: &SharedLibraryInventory,
        forced: &HashSet<&str>,
    ) -> BTreeSet<String> {
        let mut needed = BTreeSet::new();
        for (package, path) in inventory.iter() {
            if forced.contains(package) {
                continue;
            }
            let bytes = match self.fs.read_file(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(library = %path, error = %e, "cannot read library");
                    continue;
                }
            };
            match parse_dylink(&bytes) {
                Ok(info) => needed.extend(info.needed),
                Err(e) => debug!(library = %path, error = %e, "no dylink metadata"),
            }
        }
        needed
    }

    /// Decide visibility and order for every library in `inventory`.
    ///
    /// `packages` supplies the shared-library flag per package name.
    pub async fn plan(
        &self,
        inventory: &SharedLibraryInventory,
        packages: &[ResolvedPackage],
    ) -> Vec<PlannedLibrary> {
        let forced: HashSet<&str> = packages
            .iter()
            .filter(|p| p.build.shared_library)
            .map(|p| p.name.as_str())
            .collect();
        let needed = self.needed_libraries(inventory, &forced).await;
        let shared_lib_dir = self.shared_lib_dir();

        let mut plan: Vec<PlannedLibrary> = inventory
            .iter()
            .map(|(package, path)| {
                let path = normalize(path);
                let own_dir = parent(&path).to_string();
                let private_dir = self.private_lib_dir(package);

                let global = forced.contains(package)
                    || needed.contains(file_name(&path))
                    || own_dir == shared_lib_dir
                    || private_dir
                        .as_ref()
                        .is_some_and(|dir| path.starts_with(&format!("{}/", dir)));

                let mut search_paths = vec![own_dir, shared_lib_dir.clone()];
                search_paths.extend(private_dir);
                search_paths.dedup();

                PlannedLibrary {
                    package: package.to_string(),
                    path,
                    global,
                    search_paths,
                }
            })
            .collect();

        order_globals_first(&mut plan);
        plan
    }

    /// Plan and load every library in `inventory`, one at a time.
    ///
    /// Failures are logged and skipped.
    pub async fn load(
        &self,
        inventory: &SharedLibraryInventory,
        packages: &[ResolvedPackage],
        loader: &dyn DynamicLoader,
    ) -> LoadReport {
        let plan = self.plan(inventory, packages).await;
        let mut report = LoadReport::default();

        for lib in plan {
            let options = LoadOptions {
                search_paths: lib.search_paths.clone(),
                global: lib.global,
                force_reload: false,
            };
            match loader.load_library(&lib.path, options).await {
                Ok(()) => {
                    debug!(library = %lib.path, global = lib.global, "library loaded");
                    report.loaded.push(lib);
                }
                Err(e) => {
                    warn!(library = %lib.path, error = %e, "failed to load library");
                    report.failed.push((lib, e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "shared libraries loaded"
        );
        report
    }
}

impl std::fmt::Debug for LibraryLoadPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryLoadPlanner")
            .field("prefix", &self.prefix)
            .field("site_packages", &self.site_packages)
            .finish()
    }
}
