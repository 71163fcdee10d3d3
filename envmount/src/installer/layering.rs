//! Merging a mounted image tree into the prefix.
//!
//! The walk is an explicit worklist of `(source dir, destination dir,
//! materialize)` items. While materializing, missing files become symlinks
//! into the mount and missing directories become real directories, except
//! below a symlink fragment where the whole directory is linked and its
//! contents are only scanned for libraries (discovery mode).
//!
//! ```text
//! /squashfs/numpy.sqshfs/lib/python3.13/site-packages/numpy   (source)
//!                      ├── lib/          mkdir, recurse
//!                      └── .../numpy     symlink, recurse in discovery mode
//! ```

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::error::{InstallError, InstallResult};
use super::libs::{has_library_magic, is_shared_library_name, SharedLibraryInventory, LIBRARY_MAGIC};
use super::manifest::InstalledPathManifest;
use crate::package::ResolvedPackage;
use crate::vfs::{join, VfsError, VirtualFs};

struct WorkItem {
    src: String,
    dest: String,
    materialize: bool,
}

/// Path of `absolute` relative to `prefix`, without a leading slash.
pub(crate) fn relative_to<'a>(prefix: &str, absolute: &'a str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    absolute
        .strip_prefix(prefix)
        .unwrap_or(absolute)
        .trim_start_matches('/')
}

/// Whether a source directory lies strictly below one of `fragments`.
pub(crate) fn below_fragment(src: &str, fragments: &[String]) -> bool {
    fragments.iter().any(|fragment| {
        src.find(fragment.as_str())
            .is_some_and(|idx| src.len() > idx + fragment.len())
    })
}

/// Symlink-layer builder for one mounted image.
pub(crate) struct TreeMerge<'a> {
    pub fs: &'a dyn VirtualFs,
    pub package: &'a ResolvedPackage,
    pub prefix: &'a str,
    pub fragments: &'a [String],
    pub manifest: &'a Mutex<InstalledPathManifest>,
    pub inventory: &'a Mutex<SharedLibraryInventory>,
}

impl TreeMerge<'_> {
    /// Merge everything under `src_root` into the prefix.
    pub async fn run(&self, src_root: &str) -> InstallResult<()> {
        self.manifest.lock().touch(&self.package.filename);

        let mut work = vec![WorkItem {
            src: src_root.to_string(),
            dest: self.prefix.to_string(),
            materialize: true,
        }];

        while let Some(item) = work.pop() {
            let entries = self.fs.read_dir(&item.src).await?;
            // Reversed so the stack pops entries in directory order.
            for entry in entries.iter().rev() {
                let src = join(&item.src, entry);
                let dest = join(&item.dest, entry);
                if let Some(next) = self.visit(src, dest, item.materialize).await? {
                    work.push(next);
                }
            }
        }
        Ok(())
    }

    async fn visit(&self, src: String, dest: String, materialize: bool) -> InstallResult<Option<WorkItem>> {
        let Some(src_obj) = self.fs.find_object(&src).await? else {
            debug!(path = %src, "dangling entry in image, skipping");
            return Ok(None);
        };
        let dest_obj = self.fs.find_object(&dest).await?;

        if !src_obj.is_dir() && is_shared_library_name(&src) {
            let head = self.fs.read_head(&src, LIBRARY_MAGIC.len()).await?;
            if has_library_magic(&head) {
                trace!(library = %dest, "found shared library");
                self.inventory.lock().add(&self.package.name, dest.clone());
            }
        }

        match dest_obj {
            None if src_obj.is_dir() => {
                if below_fragment(&src, self.fragments) {
                    if materialize {
                        self.link(&src, &dest).await?;
                    }
                    Ok(Some(WorkItem {
                        src,
                        dest,
                        materialize: false,
                    }))
                } else {
                    if materialize {
                        self.ensure_dir(&dest).await?;
                    }
                    Ok(Some(WorkItem {
                        src,
                        dest,
                        materialize,
                    }))
                }
            }
            None => {
                if materialize {
                    self.link(&src, &dest).await?;
                }
                Ok(None)
            }
            Some(existing) if existing.is_dir() => {
                if !src_obj.is_dir() {
                    return Err(self.collision(dest));
                }
                Ok(Some(WorkItem {
                    src,
                    dest,
                    materialize,
                }))
            }
            Some(_) if materialize => Err(self.collision(dest)),
            Some(_) => Ok(None),
        }
    }

    /// Create `dest`, accepting a directory another merge created first.
    async fn ensure_dir(&self, dest: &str) -> InstallResult<()> {
        match self.fs.mkdir(dest).await {
            Ok(()) => Ok(()),
            Err(VfsError::AlreadyExists { .. }) => match self.fs.find_object(dest).await? {
                Some(existing) if existing.is_dir() => Ok(()),
                _ => Err(self.collision(dest.to_string())),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn link(&self, src: &str, dest: &str) -> InstallResult<()> {
        self.fs.symlink(src, dest).await.map_err(|e| match e {
            VfsError::AlreadyExists { .. } => self.collision(dest.to_string()),
            other => InstallError::Fs(other),
        })?;
        self.manifest
            .lock()
            .record(&self.package.filename, relative_to(self.prefix, dest), dest);
        Ok(())
    }

    fn collision(&self, path: String) -> InstallError {
        InstallError::PathCollision {
            path,
            package: self.package.filename.clone(),
        }
    }
}
