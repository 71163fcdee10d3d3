//! In-memory [`VirtualFs`] implementation.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::path::{file_name, join, normalize, parent};
use super::{BlockDevice, FsObject, FsObjectKind, VfsError, VfsResult, VirtualFs};
use crate::BoxFuture;

/// Maximum symlinks followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Bytes),
    Symlink(String),
}

/// Tree of directories, files and symlinks held in memory.
///
/// Mounts are recorded but not decoded: the device is kept so callers can
/// read through it, and the mount point becomes a directory.
pub struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    mounts: Mutex<BTreeMap<String, Arc<dyn BlockDevice>>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn components(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn not_found(path: &str) -> VfsError {
    VfsError::NotFound {
        path: path.to_string(),
    }
}

impl MemoryFs {
    /// Create a filesystem holding only the root directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            mounts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve symlinks along `path`; the last component only if
    /// `follow_last`.
    fn resolve(nodes: &BTreeMap<String, Node>, path: &str, follow_last: bool) -> VfsResult<String> {
        let mut pending = components(&normalize(path));
        let mut current = "/".to_string();
        let mut hops = 0;

        while let Some(part) = pending.pop_front() {
            let candidate = join(&current, &part);
            let is_last = pending.is_empty();
            match nodes.get(&candidate) {
                Some(Node::Symlink(target)) if !is_last || follow_last => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(VfsError::SymlinkLoop { path: path.to_string() });
                    }
                    let target = if target.starts_with('/') {
                        normalize(target)
                    } else {
                        join(&current, target)
                    };
                    let mut restart = components(&target);
                    restart.extend(pending.drain(..));
                    pending = restart;
                    current = "/".to_string();
                }
                Some(Node::File(_)) if !is_last => {
                    return Err(VfsError::NotADirectory { path: candidate });
                }
                _ => current = candidate,
            }
        }
        Ok(current)
    }

    fn children(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// Resolve the parent of `path` and require it to be a directory.
    /// Returns the resolved full path (last component not followed).
    fn resolve_in_dir(nodes: &BTreeMap<String, Node>, path: &str) -> VfsResult<String> {
        let normalized = normalize(path);
        if normalized == "/" {
            return Err(VfsError::InvalidPath { path: normalized });
        }
        let dir = Self::resolve(nodes, parent(&normalized), true)?;
        match nodes.get(&dir) {
            Some(Node::Dir) => Ok(join(&dir, file_name(&normalized))),
            Some(_) => Err(VfsError::NotADirectory { path: dir }),
            None => Err(not_found(&dir)),
        }
    }

    // -------------------------------------------------------------------------
    // Synchronous operations
    // -------------------------------------------------------------------------

    pub fn read_dir_sync(&self, path: &str) -> VfsResult<Vec<String>> {
        let nodes = self.nodes.lock();
        let dir = Self::resolve(&nodes, path, true)?;
        match nodes.get(&dir) {
            Some(Node::Dir) => Ok(Self::children(&nodes, &dir)),
            Some(_) => Err(VfsError::NotADirectory { path: dir }),
            None => Err(not_found(path)),
        }
    }

    pub fn find_object_sync(&self, path: &str) -> VfsResult<Option<FsObject>> {
        let nodes = self.nodes.lock();
        let resolved = match Self::resolve(&nodes, path, true) {
            Ok(resolved) => resolved,
            Err(VfsError::NotADirectory { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(nodes.get(&resolved).and_then(|node| match node {
            Node::Dir => Some(FsObject {
                path: resolved.clone(),
                kind: FsObjectKind::Directory,
                size: 0,
            }),
            Node::File(data) => Some(FsObject {
                path: resolved.clone(),
                kind: FsObjectKind::File,
                size: data.len() as u64,
            }),
            // Dangling link.
            Node::Symlink(_) => None,
        }))
    }

    pub fn read_file_sync(&self, path: &str) -> VfsResult<Bytes> {
        let nodes = self.nodes.lock();
        let resolved = Self::resolve(&nodes, path, true)?;
        match nodes.get(&resolved) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(VfsError::IsADirectory { path: resolved }),
            _ => Err(not_found(path)),
        }
    }

    pub fn write_file_sync(&self, path: &str, data: impl Into<Bytes>) -> VfsResult<()> {
        let mut nodes = self.nodes.lock();
        let target = Self::resolve_in_dir(&nodes, path)?;
        let target = Self::resolve(&nodes, &target, true)?;
        match nodes.get(&target) {
            Some(Node::Dir) => Err(VfsError::IsADirectory { path: target }),
            _ => {
                nodes.insert(target, Node::File(data.into()));
                Ok(())
            }
        }
    }

    pub fn mkdir_sync(&self, path: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.lock();
        let target = Self::resolve_in_dir(&nodes, path)?;
        if nodes.contains_key(&target) {
            return Err(VfsError::AlreadyExists { path: target });
        }
        nodes.insert(target, Node::Dir);
        Ok(())
    }

    pub fn mkdir_all_sync(&self, path: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.lock();
        let mut current = "/".to_string();
        for part in components(&normalize(path)) {
            let next = Self::resolve(&nodes, &join(&current, &part), true)?;
            match nodes.get(&next) {
                Some(Node::Dir) => {}
                Some(_) => return Err(VfsError::NotADirectory { path: next }),
                None => {
                    nodes.insert(next.clone(), Node::Dir);
                }
            }
            current = next;
        }
        Ok(())
    }

    pub fn symlink_sync(&self, target: &str, link: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.lock();
        let link = Self::resolve_in_dir(&nodes, link)?;
        if nodes.contains_key(&link) {
            return Err(VfsError::AlreadyExists { path: link });
        }
        nodes.insert(link, Node::Symlink(target.to_string()));
        Ok(())
    }

    pub fn remove_sync(&self, path: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.lock();
        let target = Self::resolve_in_dir(&nodes, path)?;
        match nodes.get(&target) {
            None => Err(not_found(path)),
            Some(Node::Dir) if !Self::children(&nodes, &target).is_empty() => {
                Err(VfsError::NotEmpty { path: target })
            }
            Some(_) => {
                nodes.remove(&target);
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inspection helpers
    // -------------------------------------------------------------------------

    /// Create parents as needed and write a file.
    pub fn insert_file(&self, path: &str, data: impl Into<Bytes>) -> VfsResult<()> {
        self.mkdir_all_sync(parent(&normalize(path)))?;
        self.write_file_sync(path, data)
    }

    /// Whether anything (including a dangling symlink) exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        let nodes = self.nodes.lock();
        Self::resolve(&nodes, path, false)
            .map(|resolved| nodes.contains_key(&resolved))
            .unwrap_or(false)
    }

    pub fn is_symlink(&self, path: &str) -> bool {
        self.read_link(path).is_some()
    }

    /// Target of the symlink at `path`, without following it.
    pub fn read_link(&self, path: &str) -> Option<String> {
        let nodes = self.nodes.lock();
        let resolved = Self::resolve(&nodes, path, false).ok()?;
        match nodes.get(&resolved) {
            Some(Node::Symlink(target)) => Some(target.clone()),
            _ => None,
        }
    }

    /// Device mounted at `mount_point`, if any.
    pub fn mounted_device(&self, mount_point: &str) -> Option<Arc<dyn BlockDevice>> {
        self.mounts.lock().get(&normalize(mount_point)).cloned()
    }

    /// All mount points, sorted.
    pub fn mount_points(&self) -> Vec<String> {
        self.mounts.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for MemoryFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // One lock at a time; `mount` takes `mounts` before `nodes`.
        let nodes = self.nodes.lock().len();
        let mounts = self.mount_points();
        f.debug_struct("MemoryFs")
            .field("nodes", &nodes)
            .field("mounts", &mounts)
            .finish()
    }
}

impl VirtualFs for MemoryFs {
    fn read_dir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<String>>> {
        Box::pin(async move { self.read_dir_sync(path) })
    }

    fn find_object<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Option<FsObject>>> {
        Box::pin(async move { self.find_object_sync(path) })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<u8>>> {
        Box::pin(async move { self.read_file_sync(path).map(|data| data.to_vec()) })
    }

    fn read_head<'a>(&'a self, path: &'a str, len: usize) -> BoxFuture<'a, VfsResult<Vec<u8>>> {
        Box::pin(async move {
            let data = self.read_file_sync(path)?;
            Ok(data[..len.min(data.len())].to_vec())
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, data: Vec<u8>) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move { self.write_file_sync(path, data) })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move { self.mkdir_sync(path) })
    }

    fn mkdir_all<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move { self.mkdir_all_sync(path) })
    }

    fn symlink<'a>(&'a self, target: &'a str, link: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move { self.symlink_sync(target, link) })
    }

    fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move { self.remove_sync(path) })
    }

    fn mount<'a>(
        &'a self,
        mount_point: &'a str,
        device: Arc<dyn BlockDevice>,
    ) -> BoxFuture<'a, VfsResult<()>> {
        Box::pin(async move {
            let point = normalize(mount_point);
            let mut mounts = self.mounts.lock();
            if mounts.contains_key(&point) {
                return Err(VfsError::AlreadyExists { path: point });
            }
            self.mkdir_all_sync(&point)?;
            mounts.insert(point, device);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_parent() {
        let fs = MemoryFs::new();
        assert_eq!(
            fs.write_file_sync("/a/b.txt", &b"x"[..]).unwrap_err(),
            VfsError::NotFound {
                path: "/a".to_string()
            }
        );
        fs.mkdir_sync("/a").unwrap();
        fs.write_file_sync("/a/b.txt", &b"x"[..]).unwrap();
        assert_eq!(&fs.read_file_sync("/a/b.txt").unwrap()[..], b"x");
    }

    #[test]
    fn test_write_over_directory_fails() {
        let fs = MemoryFs::new();
        fs.mkdir_all_sync("/a/b").unwrap();
        assert!(matches!(
            fs.write_file_sync("/a/b", &b"x"[..]),
            Err(VfsError::IsADirectory { .. })
        ));
    }

    #[test]
    fn test_file_as_parent_is_not_a_directory() {
        let fs = MemoryFs::new();
        fs.insert_file("/a", &b"x"[..]).unwrap();
        assert!(matches!(
            fs.mkdir_all_sync("/a/b"),
            Err(VfsError::NotADirectory { .. })
        ));
        assert!(matches!(
            fs.write_file_sync("/a/c", &b"y"[..]),
            Err(VfsError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_read_dir_lists_direct_children() {
        let fs = MemoryFs::new();
        fs.insert_file("/lib/a.so", &b"1"[..]).unwrap();
        fs.insert_file("/lib/sub/b.so", &b"2"[..]).unwrap();
        fs.insert_file("/libx", &b"3"[..]).unwrap();
        assert_eq!(fs.read_dir_sync("/lib").unwrap(), vec!["a.so", "sub"]);
        assert_eq!(fs.read_dir_sync("/").unwrap(), vec!["lib", "libx"]);
    }

    #[test]
    fn test_symlinks_are_followed() {
        let fs = MemoryFs::new();
        fs.insert_file("/mnt/pkg/lib/a.so", &b"data"[..]).unwrap();
        fs.mkdir_sync("/lib").ok();
        fs.symlink_sync("/mnt/pkg/lib", "/prefix_lib").unwrap();
        fs.symlink_sync("/prefix_lib/a.so", "/lib/a.so").unwrap();

        assert!(fs.is_symlink("/lib/a.so"));
        assert_eq!(&fs.read_file_sync("/lib/a.so").unwrap()[..], b"data");
        let obj = fs.find_object_sync("/prefix_lib").unwrap().unwrap();
        assert!(obj.is_dir());
        assert_eq!(obj.path, "/mnt/pkg/lib");
    }

    #[test]
    fn test_relative_symlink_target() {
        let fs = MemoryFs::new();
        fs.insert_file("/a/real.txt", &b"r"[..]).unwrap();
        fs.symlink_sync("real.txt", "/a/link.txt").unwrap();
        assert_eq!(&fs.read_file_sync("/a/link.txt").unwrap()[..], b"r");
    }

    #[test]
    fn test_symlink_loop_detected() {
        let fs = MemoryFs::new();
        fs.symlink_sync("/b", "/a").unwrap();
        fs.symlink_sync("/a", "/b").unwrap();
        assert!(matches!(
            fs.read_file_sync("/a"),
            Err(VfsError::SymlinkLoop { .. })
        ));
    }

    #[test]
    fn test_remove_symlink_keeps_target() {
        let fs = MemoryFs::new();
        fs.insert_file("/t.txt", &b"t"[..]).unwrap();
        fs.symlink_sync("/t.txt", "/l.txt").unwrap();
        fs.remove_sync("/l.txt").unwrap();
        assert!(!fs.exists("/l.txt"));
        assert!(fs.exists("/t.txt"));
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let fs = MemoryFs::new();
        fs.insert_file("/d/f", &b"f"[..]).unwrap();
        assert!(matches!(fs.remove_sync("/d"), Err(VfsError::NotEmpty { .. })));
    }

    #[test]
    fn test_dangling_symlink_is_not_an_object() {
        let fs = MemoryFs::new();
        fs.symlink_sync("/nowhere", "/dangling").unwrap();
        assert!(fs.exists("/dangling"));
        assert_eq!(fs.find_object_sync("/dangling").unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_head_truncates() {
        let fs = MemoryFs::new();
        fs.insert_file("/f", &b"\0asm\x01\0\0\0"[..]).unwrap();
        assert_eq!(fs.read_head("/f", 4).await.unwrap(), b"\0asm");
        assert_eq!(fs.read_head("/f", 100).await.unwrap().len(), 8);
    }

    struct EmptyDevice;

    impl BlockDevice for EmptyDevice {
        fn size(&self) -> u64 {
            0
        }

        fn read_at<'a>(&'a self, _offset: u64, _buf: &'a mut [u8]) -> BoxFuture<'a, VfsResult<usize>> {
            Box::pin(async { Ok(0) })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debug_while_mounting_does_not_block() {
        let fs = Arc::new(MemoryFs::new());

        let mounting = {
            let fs = Arc::clone(&fs);
            tokio::spawn(async move {
                for i in 0..200 {
                    fs.mount(&format!("/mnt/{}", i), Arc::new(EmptyDevice))
                        .await
                        .unwrap();
                }
            })
        };
        let formatting = {
            let fs = Arc::clone(&fs);
            tokio::spawn(async move {
                for _ in 0..200 {
                    assert!(format!("{:?}", fs).contains("MemoryFs"));
                    tokio::task::yield_now().await;
                }
            })
        };

        let both = async {
            mounting.await.unwrap();
            formatting.await.unwrap();
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), both)
            .await
            .unwrap();
        assert_eq!(fs.mount_points().len(), 200);
    }
}
