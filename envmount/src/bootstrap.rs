//! Environment bootstrap.
//!
//! Ties the installer, the resolver seam and the load planner together:
//!
//! ```text
//! bootstrap_lock(lock)      mounts ─▶ packages ─▶ Environment
//! install_specs(env, ...)   solve ─▶ diff ─▶ uninstall ─▶ install ─▶ pip solve ─▶ wheels
//! load_shared_libraries     LibraryLoadPlanner over env.libraries
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{BlockBridge, BridgeError};
use crate::dynload::{DynamicLoader, LibraryLoadPlanner, LoadReport};
use crate::installer::{
    Extractor, InstallError, InstalledPathManifest, InstallerConfig, LayeredInstaller,
    SharedLibraryInventory,
};
use crate::mount::{ImageMounter, MountGate, RemoteImageMounter};
use crate::package::{
    python_version, render_package_list, EnvironmentDiff, EnvironmentLock, LockError, PackageMap,
    PythonVersion, ResolvedPackage,
};
use crate::rendezvous::{LayoutError, SharedRegion};
use crate::resolver::{ResolveError, Resolver, SolveRequest};
use crate::stream::{HttpRangeSource, RangeSource, StreamConfig, StreamError};
use crate::vfs::VirtualFs;

/// Channels searched when none are configured.
pub const DEFAULT_CHANNELS: [&str; 2] = ["emscripten-forge", "conda-forge"];

/// Platform subdirs solved for when none are configured.
pub const DEFAULT_PLATFORM_TAGS: [&str; 2] = ["emscripten-wasm32", "noarch"];

/// Default shared region size.
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("no resolver configured")]
    NoResolver,
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Bootstrap settings.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub installer: InstallerConfig,
    pub stream: StreamConfig,
    /// Bytes of the shared region used by the block bridge.
    pub region_size: usize,
    pub channels: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            installer: InstallerConfig::default(),
            stream: StreamConfig::default(),
            region_size: DEFAULT_REGION_SIZE,
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            platform_tags: DEFAULT_PLATFORM_TAGS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl BootstrapConfig {
    pub fn with_installer(mut self, installer: InstallerConfig) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_platform_tags(mut self, tags: Vec<String>) -> Self {
        self.platform_tags = tags;
        self
    }
}

/// An installed environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub prefix: String,
    /// Installed packages by filename.
    pub packages: PackageMap,
    pub manifest: InstalledPathManifest,
    pub libraries: SharedLibraryInventory,
    /// Interpreter version override.
    pub python_override: Option<PythonVersion>,
}

impl Environment {
    /// Interpreter version: the override, or the `python` package's.
    pub fn python_version(&self) -> Option<PythonVersion> {
        self.python_override
            .or_else(|| python_version(self.packages.values()))
    }

    /// Installed packages as a table.
    pub fn package_list(&self) -> String {
        render_package_list(&self.packages)
    }
}

/// Installs environments into one virtual filesystem.
pub struct Bootstrapper {
    fs: Arc<dyn VirtualFs>,
    installer: LayeredInstaller,
    resolver: Option<Arc<dyn Resolver>>,
    config: BootstrapConfig,
}

impl Bootstrapper {
    pub fn new(
        fs: Arc<dyn VirtualFs>,
        extractor: Arc<dyn Extractor>,
        mounter: Arc<dyn ImageMounter>,
        gate: Arc<MountGate>,
        config: BootstrapConfig,
    ) -> Self {
        let installer = LayeredInstaller::new(
            Arc::clone(&fs),
            extractor,
            mounter,
            gate,
            config.installer.clone(),
        );
        Self {
            fs,
            installer,
            resolver: None,
            config,
        }
    }

    /// Bootstrapper whose images stream over HTTP through a block bridge.
    ///
    /// The bridge runs until `shutdown` is cancelled.
    pub fn streaming(
        fs: Arc<dyn VirtualFs>,
        extractor: Arc<dyn Extractor>,
        gate: Arc<MountGate>,
        config: BootstrapConfig,
        shutdown: CancellationToken,
    ) -> BootstrapResult<Self> {
        let region = Arc::new(SharedRegion::new(config.region_size)?);
        let source: Arc<dyn RangeSource> = Arc::new(HttpRangeSource::new(config.stream.timeout)?);
        let client = BlockBridge::spawn(region, config.stream.clone(), source, shutdown)?;
        let mounter = Arc::new(RemoteImageMounter::new(client, Arc::clone(&fs)));
        Ok(Self::new(fs, extractor, mounter, gate, config))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn installer(&self) -> &LayeredInstaller {
        &self.installer
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    fn new_environment(&self) -> Environment {
        Environment {
            prefix: self.config.installer.prefix.clone(),
            python_override: self.config.installer.python_version,
            ..Default::default()
        }
    }

    /// Install a locked environment: mount-point archives first, then
    /// every package.
    pub async fn bootstrap_lock(&self, lock: &EnvironmentLock) -> BootstrapResult<Environment> {
        if lock.prefix != self.config.installer.prefix {
            debug!(
                lock_prefix = %lock.prefix,
                prefix = %self.config.installer.prefix,
                "lock prefix differs from configured prefix"
            );
        }
        if !lock.mounts.is_empty() {
            let files = self.installer.install_mount_points(&lock.mounts).await?;
            info!(mounts = lock.mounts.len(), files, "mount points extracted");
        }

        let mut env = self.new_environment();
        env.packages = lock.resolved_packages();
        let packages: Vec<ResolvedPackage> = env.packages.values().cloned().collect();
        env.libraries = self
            .installer
            .install_with_python(&packages, env.python_version(), &mut env.manifest)
            .await?;

        info!(packages = env.packages.len(), "environment bootstrapped");
        Ok(env)
    }

    /// Solve `specs` and `pip_specs` against `env` and apply the result.
    ///
    /// Returns the applied diff; wheels appear as additions.
    pub async fn install_specs(
        &self,
        env: &mut Environment,
        specs: &[String],
        pip_specs: &[String],
    ) -> BootstrapResult<EnvironmentDiff> {
        let resolver = self.resolver.as_ref().ok_or(BootstrapError::NoResolver)?;
        let mut diff = EnvironmentDiff::default();

        if !specs.is_empty() {
            let (wheels, native): (PackageMap, PackageMap) =
                env.packages.clone().into_iter().partition(|(_, p)| p.is_pip());
            let request = SolveRequest::new(specs.to_vec())
                .with_channels(self.config.channels.clone())
                .with_platform_tags(self.config.platform_tags.clone())
                .with_installed(native.clone());
            let solved = resolver.solve(request).await?;
            diff = EnvironmentDiff::between(&native, &solved);

            // Wheels are outside the solve; they go only when it now provides their name.
            let solved_names: HashSet<&str> = solved.values().map(|p| p.name.as_str()).collect();
            diff.removed.extend(
                wheels
                    .into_values()
                    .filter(|w| solved_names.contains(w.name.as_str())),
            );
            debug!(table = %diff.render_table(), "environment diff");

            let removed = diff.to_remove();
            self.installer.uninstall(&mut env.manifest, &removed).await?;
            for pkg in &removed {
                env.packages.remove(&pkg.filename);
                env.libraries.remove_package(&pkg.name);
            }

            let python = env
                .python_override
                .or_else(|| python_version(solved.values()));
            let added = diff.to_install();
            let libraries = self
                .installer
                .install_with_python(&added, python, &mut env.manifest)
                .await?;
            env.libraries.merge(libraries);
            env.packages
                .extend(added.into_iter().map(|p| (p.filename.clone(), p)));
        }

        if !pip_specs.is_empty() {
            let python = env
                .python_version()
                .ok_or_else(|| InstallError::PythonRequired {
                    package: pip_specs.join(" "),
                })?;
            let wheels: Vec<ResolvedPackage> = resolver
                .solve_pip(pip_specs, &env.packages, python)
                .await?
                .into_values()
                .filter(|w| !env.packages.contains_key(&w.filename))
                .collect();

            let libraries = self
                .installer
                .install_with_python(&wheels, Some(python), &mut env.manifest)
                .await?;
            env.libraries.merge(libraries);
            for wheel in wheels {
                diff.added.push(wheel.clone());
                env.packages.insert(wheel.filename.clone(), wheel);
            }
        }

        info!(
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "specs applied"
        );
        Ok(diff)
    }

    /// Load every shared library of `env` through `loader`.
    pub async fn load_shared_libraries(
        &self,
        env: &Environment,
        loader: &dyn DynamicLoader,
    ) -> LoadReport {
        let planner = LibraryLoadPlanner::new(Arc::clone(&self.fs), &env.prefix, env.python_version());
        let packages: Vec<ResolvedPackage> = env.packages.values().cloned().collect();
        planner.load(&env.libraries, &packages, loader).await
    }
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("config", &self.config)
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}
