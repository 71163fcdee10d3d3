//! Layered package installer.
//!
//! Materializes resolved packages into the virtual filesystem under one
//! prefix, records every installed path per package, and collects the
//! loadable shared libraries it comes across.
//!
//! # Package kinds
//!
//! ```text
//! Archive ──extract──▶ split info/ ──▶ [conda-meta] ──▶ [wheel prefix] ──▶ write files
//! Image   ──MountGate::ensure_mounted──▶ mount at <mount_root>/<filename>
//!                                      └─▶ merge tree into prefix (symlink layer)
//! ```
//!
//! Packages of one `install` call run concurrently. The first failure
//! cancels the others; paths already placed stay recorded in the manifest.
//!
//! Mounting and layering are tracked apart: an image stays mounted after
//! its package is uninstalled, and a later install layers the existing
//! mount again.

mod error;
mod extract;
mod layering;
mod libs;
mod manifest;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::mount::{ImageMounter, MountGate, MountStatus};
use crate::package::{
    python_version, ContentKind, LockedMount, PythonVersion, ResolvedPackage,
};
use crate::vfs::{join, parent, VfsError, VirtualFs};

pub use error::{InstallError, InstallResult};
pub use extract::{
    conda_meta_file, split_package_info, ExtractError, ExtractedFileSet, Extractor,
    PackageContents,
};
pub use libs::{has_library_magic, is_shared_library_name, SharedLibraryInventory, LIBRARY_MAGIC};
pub use manifest::InstalledPathManifest;

use layering::{relative_to, TreeMerge};

/// Default directory under which images are mounted.
pub const DEFAULT_MOUNT_ROOT: &str = "/squashfs";

/// Installer settings.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Environment root every package is installed under.
    pub prefix: String,

    /// Base URL for packages without an explicit URL.
    pub pkg_root_url: String,

    /// Directory holding one mount point per image.
    pub mount_root: String,

    /// Source path fragments below which image directories are linked
    /// whole. `None` derives `/lib/pythonX.Y/site-packages/` from the
    /// interpreter version.
    pub symlink_dir_fragments: Option<Vec<String>>,

    /// Interpreter version; discovered from the packages when unset.
    pub python_version: Option<PythonVersion>,

    /// Write `conda-meta/*.json` records for archive packages.
    pub generate_conda_meta: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            pkg_root_url: String::new(),
            mount_root: DEFAULT_MOUNT_ROOT.to_string(),
            symlink_dir_fragments: None,
            python_version: None,
            generate_conda_meta: false,
        }
    }
}

impl InstallerConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_pkg_root_url(mut self, url: impl Into<String>) -> Self {
        self.pkg_root_url = url.into();
        self
    }

    pub fn with_mount_root(mut self, root: impl Into<String>) -> Self {
        self.mount_root = root.into();
        self
    }

    pub fn with_symlink_dir_fragments(mut self, fragments: Vec<String>) -> Self {
        self.symlink_dir_fragments = Some(fragments);
        self
    }

    pub fn with_python_version(mut self, version: PythonVersion) -> Self {
        self.python_version = Some(version);
        self
    }

    pub fn with_generate_conda_meta(mut self, enabled: bool) -> Self {
        self.generate_conda_meta = enabled;
        self
    }

    /// Fragments in effect for `python`.
    pub fn fragments_for(&self, python: Option<PythonVersion>) -> Vec<String> {
        match (&self.symlink_dir_fragments, python) {
            (Some(fragments), _) => fragments.clone(),
            (None, Some(python)) => vec![format!("/{}/", python.site_packages())],
            (None, None) => Vec::new(),
        }
    }
}

/// Shared state of one `install` call.
struct InstallRun {
    python: Option<PythonVersion>,
    fragments: Vec<String>,
    manifest: Mutex<InstalledPathManifest>,
    inventory: Mutex<SharedLibraryInventory>,
}

/// Installs and removes packages in one prefix.
pub struct LayeredInstaller {
    fs: Arc<dyn VirtualFs>,
    extractor: Arc<dyn Extractor>,
    mounter: Arc<dyn ImageMounter>,
    gate: Arc<MountGate>,
    config: InstallerConfig,
    /// Image filenames whose tree is currently layered into the prefix.
    layered: Mutex<HashSet<String>>,
}

impl LayeredInstaller {
    pub fn new(
        fs: Arc<dyn VirtualFs>,
        extractor: Arc<dyn Extractor>,
        mounter: Arc<dyn ImageMounter>,
        gate: Arc<MountGate>,
        config: InstallerConfig,
    ) -> Self {
        Self {
            fs,
            extractor,
            mounter,
            gate,
            config,
            layered: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<dyn VirtualFs> {
        &self.fs
    }

    /// Install `packages`, recording their paths into `manifest`.
    ///
    /// The interpreter version comes from the configuration or, failing
    /// that, from the `python` package in `packages`.
    pub async fn install(
        &self,
        packages: &[ResolvedPackage],
        manifest: &mut InstalledPathManifest,
    ) -> InstallResult<SharedLibraryInventory> {
        let python = self
            .config
            .python_version
            .or_else(|| python_version(packages));
        self.install_with_python(packages, python, manifest).await
    }

    /// Install `packages` against an explicit interpreter version.
    pub async fn install_with_python(
        &self,
        packages: &[ResolvedPackage],
        python: Option<PythonVersion>,
        manifest: &mut InstalledPathManifest,
    ) -> InstallResult<SharedLibraryInventory> {
        let run = InstallRun {
            python,
            fragments: self.config.fragments_for(python),
            manifest: Mutex::new(InstalledPathManifest::new()),
            inventory: Mutex::new(SharedLibraryInventory::new()),
        };

        let result = try_join_all(packages.iter().map(|pkg| self.install_package(pkg, &run))).await;

        manifest.merge(run.manifest.into_inner());
        result?;

        let inventory = run.inventory.into_inner();
        info!(
            packages = packages.len(),
            libraries = inventory.len(),
            "install complete"
        );
        Ok(inventory)
    }

    async fn install_package(&self, pkg: &ResolvedPackage, run: &InstallRun) -> InstallResult<()> {
        match pkg.kind {
            ContentKind::Archive => self.install_archive(pkg, run).await,
            ContentKind::Image => self.install_image(pkg, run).await,
        }
    }

    async fn install_archive(&self, pkg: &ResolvedPackage, run: &InstallRun) -> InstallResult<()> {
        let url = pkg.resolve_url(&self.config.pkg_root_url);
        debug!(package = %pkg.filename, url = %url, "extracting archive");

        let files: ExtractedFileSet = if pkg.is_wheel() {
            let python = run.python.ok_or_else(|| InstallError::PythonRequired {
                package: pkg.filename.clone(),
            })?;
            let site_packages = python.site_packages();
            self.extract(&url)
                .await?
                .into_iter()
                .map(|(path, data)| (format!("{}/{}", site_packages, path), data))
                .collect()
        } else {
            let raw = self.extract(&url).await?;
            let contents = split_package_info(&pkg.filename, raw, self.extractor.as_ref()).await?;
            let mut files = contents.payload;
            if self.config.generate_conda_meta {
                if let Some((path, data)) = conda_meta_file(&pkg.filename, &contents.info)? {
                    files.insert(path, data);
                }
            }
            files
        };

        for (relative, data) in &files {
            if is_shared_library_name(relative) && has_library_magic(data) {
                let absolute = join(&self.config.prefix, relative);
                run.inventory.lock().add(&pkg.name, absolute);
            }
        }

        run.manifest.lock().touch(&pkg.filename);
        let count = files.len();
        for (relative, data) in files {
            let absolute = join(&self.config.prefix, &relative);
            self.place_file(&absolute, data, &pkg.filename).await?;
            run.manifest
                .lock()
                .record(&pkg.filename, relative_to(&self.config.prefix, &absolute), absolute.clone());
        }

        info!(package = %pkg.filename, files = count, "package installed");
        Ok(())
    }

    async fn install_image(&self, pkg: &ResolvedPackage, run: &InstallRun) -> InstallResult<()> {
        let url = pkg.resolve_url(&self.config.pkg_root_url);
        let mount_point = join(&self.config.mount_root, &pkg.filename);

        let status = self
            .gate
            .ensure_mounted(&url, || async {
                self.fs.mkdir_all(&self.config.mount_root).await?;
                self.mounter.mount(&url, &mount_point).await?;
                self.layer_image(pkg, &mount_point, run).await.map(|_| ())
            })
            .await?;

        match status {
            MountStatus::Mounted => info!(package = %pkg.filename, url = %url, "image installed"),
            MountStatus::Joined | MountStatus::AlreadyMounted => {
                if self.layer_image(pkg, &mount_point, run).await? {
                    info!(package = %pkg.filename, url = %url, "image layered from existing mount");
                } else {
                    debug!(package = %pkg.filename, url = %url, ?status, "image already layered");
                }
            }
        }
        Ok(())
    }

    /// Merge a mounted image into the prefix unless it is already layered.
    ///
    /// Returns whether this call ran the merge.
    async fn layer_image(&self, pkg: &ResolvedPackage, mount_point: &str, run: &InstallRun) -> InstallResult<bool> {
        if !self.layered.lock().insert(pkg.filename.clone()) {
            return Ok(false);
        }
        let result = TreeMerge {
            fs: self.fs.as_ref(),
            package: pkg,
            prefix: &self.config.prefix,
            fragments: &run.fragments,
            manifest: &run.manifest,
            inventory: &run.inventory,
        }
        .run(mount_point)
        .await;
        if result.is_err() {
            self.layered.lock().remove(&pkg.filename);
        }
        result.map(|()| true)
    }

    async fn extract(&self, url: &str) -> InstallResult<ExtractedFileSet> {
        self.extractor
            .extract(url)
            .await
            .map_err(|e| InstallError::Extract {
                source_name: url.to_string(),
                reason: e.reason,
            })
    }

    /// Write one file, creating parent directories.
    async fn place_file(&self, absolute: &str, data: Bytes, package: &str) -> InstallResult<()> {
        let collision = || InstallError::PathCollision {
            path: absolute.to_string(),
            package: package.to_string(),
        };
        let as_collision = |e: VfsError| match e {
            VfsError::NotADirectory { .. }
            | VfsError::IsADirectory { .. }
            | VfsError::AlreadyExists { .. } => collision(),
            other => InstallError::Fs(other),
        };

        match self.fs.find_object(absolute).await.map_err(as_collision)? {
            Some(existing) if existing.is_dir() => return Err(collision()),
            _ => {}
        }
        self.fs
            .mkdir_all(parent(absolute))
            .await
            .map_err(as_collision)?;
        self.fs
            .write_file(absolute, data.to_vec())
            .await
            .map_err(as_collision)
    }

    /// Remove every recorded path of `removed` and drop their entries.
    ///
    /// Stops at the first package without a manifest entry.
    pub async fn uninstall(
        &self,
        manifest: &mut InstalledPathManifest,
        removed: &[ResolvedPackage],
    ) -> InstallResult<()> {
        for pkg in removed {
            let key = manifest
                .find_key(pkg)
                .ok_or_else(|| InstallError::ManifestMissing {
                    package: pkg.filename.clone(),
                })?;
            let paths = manifest.remove(&key).unwrap_or_default();
            {
                let mut layered = self.layered.lock();
                layered.remove(&key);
                layered.remove(&pkg.filename);
            }

            for absolute in paths.values() {
                if let Err(e) = self.fs.remove(absolute).await {
                    warn!(path = %absolute, error = %e, "failed to remove installed path");
                }
            }
            info!(package = %key, paths = paths.len(), "package removed");
        }
        Ok(())
    }

    /// Unpack mount-point archives into the prefix. Their files are not
    /// tracked in any manifest.
    pub async fn install_mount_points(&self, mounts: &[LockedMount]) -> InstallResult<usize> {
        let counts = try_join_all(mounts.iter().map(|mount| async move {
            let url = format!(
                "{}/{}",
                self.config.pkg_root_url.trim_end_matches('/'),
                mount.filename
            );
            info!(mount = %mount.name, url = %url, "extracting mount point");
            let files = self.extract(&url).await?;
            let count = files.len();
            for (relative, data) in files {
                let absolute = join(&self.config.prefix, &relative);
                self.place_file(&absolute, data, &mount.filename).await?;
            }
            Ok::<usize, InstallError>(count)
        }))
        .await?;
        Ok(counts.into_iter().sum())
    }
}

impl std::fmt::Debug for LayeredInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredInstaller")
            .field("config", &self.config)
            .finish()
    }
}
