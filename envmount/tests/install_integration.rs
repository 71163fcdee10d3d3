//! Integration tests for installing and loading an environment.
//!
//! These tests verify the install flow end to end:
//! - archive and image packages layered into one prefix
//! - single-flight mounting across concurrent installs
//! - uninstall with drifted filenames
//! - reinstalling an image after uninstall
//! - parallel image merges over a shared directory
//! - load planning over the installed libraries
//!
//! Run with: `cargo test --test install_integration`

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use envmount::dynload::{DynamicLoader, LibraryLoadPlanner, LoadError, LoadOptions};
use envmount::installer::{
    ExtractError, ExtractedFileSet, Extractor, InstalledPathManifest, InstallerConfig,
    LayeredInstaller,
};
use envmount::mount::{ImageMounter, MountError, MountGate};
use envmount::package::{PythonVersion, ResolvedPackage};
use envmount::vfs::{join, BlockDevice, FsObject, MemoryFs, VfsResult, VirtualFs};
use envmount::BoxFuture;

// ============================================================================
// Helper Functions
// ============================================================================

const ROOT: &str = "https://pkgs.example.org";

/// Minimal module with a `dylink.0` needed list.
fn library(needed: &[&str]) -> Vec<u8> {
    fn uleb(mut value: u32, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }
    fn name(s: &str, out: &mut Vec<u8>) {
        uleb(s.len() as u32, out);
        out.extend_from_slice(s.as_bytes());
    }

    let mut mem_info = Vec::new();
    for v in [0, 0, 0, 0] {
        uleb(v, &mut mem_info);
    }
    let mut needed_list = Vec::new();
    uleb(needed.len() as u32, &mut needed_list);
    for lib in needed {
        name(lib, &mut needed_list);
    }

    let mut payload = Vec::new();
    name("dylink.0", &mut payload);
    payload.push(1);
    uleb(mem_info.len() as u32, &mut payload);
    payload.extend_from_slice(&mem_info);
    payload.push(2);
    uleb(needed_list.len() as u32, &mut payload);
    payload.extend_from_slice(&needed_list);

    let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
    out.push(0);
    uleb(payload.len() as u32, &mut out);
    out.extend_from_slice(&payload);
    out
}

#[derive(Default)]
struct MapExtractor {
    archives: HashMap<String, ExtractedFileSet>,
}

impl MapExtractor {
    fn with(mut self, filename: &str, files: Vec<(&str, Vec<u8>)>) -> Self {
        self.archives.insert(
            format!("{}/{}", ROOT, filename),
            files
                .into_iter()
                .map(|(k, v)| (k.to_string(), Bytes::from(v)))
                .collect(),
        );
        self
    }
}

impl Extractor for MapExtractor {
    fn extract<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ExtractedFileSet, ExtractError>> {
        Box::pin(async move {
            self.archives
                .get(url)
                .cloned()
                .ok_or_else(|| ExtractError::new(format!("404 {}", url)))
        })
    }

    fn extract_data<'a>(&'a self, _data: Bytes) -> BoxFuture<'a, Result<ExtractedFileSet, ExtractError>> {
        Box::pin(async { Err(ExtractError::new("unsupported")) })
    }
}

/// Populates the mount point with a fixed tree per image URL.
struct TreeMounter {
    fs: Arc<MemoryFs>,
    trees: HashMap<String, Vec<(&'static str, Vec<u8>)>>,
    mounts: AtomicUsize,
}

impl TreeMounter {
    fn new(fs: Arc<MemoryFs>) -> Self {
        Self {
            fs,
            trees: HashMap::new(),
            mounts: AtomicUsize::new(0),
        }
    }

    fn with(mut self, filename: &str, files: Vec<(&'static str, Vec<u8>)>) -> Self {
        self.trees.insert(format!("{}/{}", ROOT, filename), files);
        self
    }
}

impl ImageMounter for TreeMounter {
    fn mount<'a>(&'a self, url: &'a str, mount_point: &'a str) -> BoxFuture<'a, Result<(), MountError>> {
        Box::pin(async move {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            // Let concurrent installs reach the gate.
            tokio::task::yield_now().await;

            let failed = |reason: String| MountError::Failed {
                url: url.to_string(),
                reason,
            };
            let files = self
                .trees
                .get(url)
                .ok_or_else(|| failed("unknown image".to_string()))?;
            self.fs
                .mkdir_all_sync(mount_point)
                .map_err(|e| failed(e.to_string()))?;
            for (relative, data) in files {
                self.fs
                    .insert_file(&join(mount_point, relative), data.clone())
                    .map_err(|e| failed(e.to_string()))?;
            }
            Ok(())
        })
    }
}

/// Yields before every call so concurrent merges interleave.
struct YieldingFs(Arc<MemoryFs>);

impl VirtualFs for YieldingFs {
    fn read_dir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<String>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.read_dir(path).await
        })
    }

    fn find_object<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Option<FsObject>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.find_object(path).await
        })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<u8>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.read_file(path).await
        })
    }

    fn read_head<'a>(&'a self, path: &'a str, len: usize) -> BoxFuture<'a, VfsResult<Vec<u8>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.read_head(path, len).await
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, data: Vec<u8>) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.write_file(path, data).await
        })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.mkdir(path).await
        })
    }

    fn mkdir_all<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.mkdir_all(path).await
        })
    }

    fn symlink<'a>(&'a self, target: &'a str, link: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.symlink(target, link).await
        })
    }

    fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.remove(path).await
        })
    }

    fn mount<'a>(
        &'a self,
        mount_point: &'a str,
        device: Arc<dyn BlockDevice>,
    ) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.mount(mount_point, device).await
        })
    }
}

/// Records every load call in order.
#[derive(Default)]
struct RecordingLoader {
    calls: Mutex<Vec<(String, bool)>>,
}

impl DynamicLoader for RecordingLoader {
    fn load_library<'a>(
        &'a self,
        path: &'a str,
        options: LoadOptions,
    ) -> BoxFuture<'a, Result<(), LoadError>> {
        Box::pin(async move {
            self.calls.lock().push((path.to_string(), options.global));
            Ok(())
        })
    }
}

fn numpy() -> ResolvedPackage {
    ResolvedPackage::new("numpy", "2.2.0", "numpy-2.2.0-h0.sqshfs").with_build_string("h0")
}

fn openblas() -> ResolvedPackage {
    ResolvedPackage::new("openblas", "0.3.28", "openblas-0.3.28-h0.tar.bz2").with_build_string("h0")
}

fn numpy_tree() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (
            "lib/python3.13/site-packages/numpy/core.so",
            library(&["libopenblas.so"]),
        ),
        ("lib/python3.13/site-packages/numpy/__init__.py", b"".to_vec()),
        ("bin/f2py", b"#!".to_vec()),
    ]
}

struct Setup {
    fs: Arc<MemoryFs>,
    mounter: Arc<TreeMounter>,
    installer: LayeredInstaller,
}

fn setup() -> Setup {
    let fs = Arc::new(MemoryFs::new());
    let extractor = MapExtractor::default().with(
        "openblas-0.3.28-h0.tar.bz2",
        vec![
            ("lib/libopenblas.so", library(&[])),
            ("info/index.json", br#"{"name":"openblas"}"#.to_vec()),
        ],
    );
    let mounter = Arc::new(TreeMounter::new(Arc::clone(&fs)).with("numpy-2.2.0-h0.sqshfs", numpy_tree()));
    let config = InstallerConfig::default()
        .with_pkg_root_url(ROOT)
        .with_python_version(PythonVersion::new(3, 13))
        .with_generate_conda_meta(false);
    let installer = LayeredInstaller::new(
        Arc::clone(&fs) as Arc<dyn VirtualFs>,
        Arc::new(extractor),
        Arc::clone(&mounter) as Arc<dyn ImageMounter>,
        Arc::new(MountGate::new()),
        config,
    );
    Setup {
        fs,
        mounter,
        installer,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_archive_and_image_share_prefix() {
    let Setup { fs, installer, .. } = setup();
    let mut manifest = InstalledPathManifest::new();

    let inventory = installer
        .install(&[openblas(), numpy()], &mut manifest)
        .await
        .unwrap();

    assert!(fs.exists("/lib/libopenblas.so"));
    assert!(!fs.exists("/info/index.json"));
    assert!(fs.is_symlink("/lib/python3.13/site-packages/numpy"));
    assert!(fs.is_symlink("/bin/f2py"));
    assert!(!fs.is_symlink("/lib/python3.13"));

    assert_eq!(inventory.libraries("openblas"), ["/lib/libopenblas.so".to_string()]);
    assert_eq!(
        inventory.libraries("numpy"),
        ["/lib/python3.13/site-packages/numpy/core.so".to_string()]
    );
    assert!(manifest
        .paths("numpy-2.2.0-h0.sqshfs")
        .unwrap()
        .contains_key("bin/f2py"));
    assert_eq!(
        manifest
            .paths("openblas-0.3.28-h0.tar.bz2")
            .unwrap()
            .get("lib/libopenblas.so")
            .map(String::as_str),
        Some("/lib/libopenblas.so")
    );
}

#[tokio::test]
async fn test_concurrent_installs_mount_once() {
    let Setup {
        fs,
        mounter,
        installer,
    } = setup();
    let mut first = InstalledPathManifest::new();
    let mut second = InstalledPathManifest::new();

    let pkgs = [numpy()];
    let (a, b) = tokio::join!(
        installer.install(&pkgs, &mut first),
        installer.install(&pkgs, &mut second),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(first.len() + second.len(), 1);
    assert!(fs.is_symlink("/bin/f2py"));
}

#[tokio::test]
async fn test_uninstall_matches_drifted_filename() {
    let Setup { fs, installer, .. } = setup();
    let mut manifest = InstalledPathManifest::new();
    installer.install(&[openblas()], &mut manifest).await.unwrap();
    assert!(fs.exists("/lib/libopenblas.so"));

    let drifted = ResolvedPackage::new("openblas", "0.3.28", "openblas-0.3.28-h0.conda")
        .with_build_string("h0");
    installer.uninstall(&mut manifest, &[drifted]).await.unwrap();

    assert!(!fs.exists("/lib/libopenblas.so"));
    assert!(manifest.is_empty());
}

#[tokio::test]
async fn test_installed_libraries_load_globals_first() {
    let Setup { fs, installer, .. } = setup();
    let mut manifest = InstalledPathManifest::new();
    let packages = [numpy(), openblas()];
    let inventory = installer.install(&packages, &mut manifest).await.unwrap();

    let planner = LibraryLoadPlanner::new(
        Arc::clone(&fs) as Arc<dyn VirtualFs>,
        "/",
        Some(PythonVersion::new(3, 13)),
    );
    let loader = RecordingLoader::default();
    let report = planner.load(&inventory, &packages, &loader).await;

    assert!(report.is_complete());
    assert_eq!(
        *loader.calls.lock(),
        vec![
            ("/lib/libopenblas.so".to_string(), true),
            ("/lib/python3.13/site-packages/numpy/core.so".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn test_image_reinstalls_after_uninstall() {
    let Setup {
        fs,
        mounter,
        installer,
    } = setup();
    let mut manifest = InstalledPathManifest::new();

    installer.install(&[numpy()], &mut manifest).await.unwrap();
    installer.uninstall(&mut manifest, &[numpy()]).await.unwrap();
    assert!(!fs.exists("/bin/f2py"));
    assert!(manifest.is_empty());

    let inventory = installer.install(&[numpy()], &mut manifest).await.unwrap();

    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
    assert!(fs.is_symlink("/bin/f2py"));
    assert!(fs.is_symlink("/lib/python3.13/site-packages/numpy"));
    assert!(manifest
        .paths("numpy-2.2.0-h0.sqshfs")
        .unwrap()
        .contains_key("bin/f2py"));
    assert_eq!(
        inventory.libraries("numpy"),
        ["/lib/python3.13/site-packages/numpy/core.so".to_string()]
    );
}

#[tokio::test]
async fn test_parallel_images_share_new_directories() {
    let fs = Arc::new(MemoryFs::new());
    let mounter = TreeMounter::new(Arc::clone(&fs))
        .with("a-1-h0.sqshfs", vec![("lib/liba.so", library(&[]))])
        .with("b-1-h0.sqshfs", vec![("lib/libb.so", library(&[]))]);
    let installer = LayeredInstaller::new(
        Arc::new(YieldingFs(Arc::clone(&fs))),
        Arc::new(MapExtractor::default()),
        Arc::new(mounter),
        Arc::new(MountGate::new()),
        InstallerConfig::default().with_pkg_root_url(ROOT),
    );
    let packages = [
        ResolvedPackage::new("a", "1", "a-1-h0.sqshfs").with_build_string("h0"),
        ResolvedPackage::new("b", "1", "b-1-h0.sqshfs").with_build_string("h0"),
    ];
    let mut manifest = InstalledPathManifest::new();

    let inventory = installer.install(&packages, &mut manifest).await.unwrap();

    assert!(!fs.is_symlink("/lib"));
    assert!(fs.is_symlink("/lib/liba.so"));
    assert!(fs.is_symlink("/lib/libb.so"));
    assert_eq!(inventory.libraries("a"), ["/lib/liba.so".to_string()]);
    assert_eq!(inventory.libraries("b"), ["/lib/libb.so".to_string()]);
    assert_eq!(manifest.len(), 2);
}
