//! Shared-library detection and the per-package inventory.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// First four bytes of a loadable binary module.
pub const LIBRARY_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

fn library_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // `libz.so`, `libz.so.1`, `libz.so.1.3.1`
    PATTERN.get_or_init(|| Regex::new(r"\.so(\.\d+)*$").unwrap())
}

/// Whether a file name looks like a shared library.
pub fn is_shared_library_name(path: &str) -> bool {
    library_name_pattern().is_match(path)
}

/// Whether `bytes` starts with [`LIBRARY_MAGIC`].
pub fn has_library_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(&LIBRARY_MAGIC)
}

/// Loadable libraries found during install, by package name.
///
/// Packages iterate in name order; each package keeps discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedLibraryInventory {
    libraries: BTreeMap<String, Vec<String>>,
}

impl SharedLibraryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a library path for `package`. Duplicate paths are ignored.
    pub fn add(&mut self, package: &str, path: impl Into<String>) {
        let path = path.into();
        let list = self.libraries.entry(package.to_string()).or_default();
        if !list.contains(&path) {
            list.push(path);
        }
    }

    /// Libraries of one package.
    pub fn libraries(&self, package: &str) -> &[String] {
        self.libraries
            .get(package)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// `(package, library path)` pairs in inventory order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.libraries
            .iter()
            .flat_map(|(pkg, libs)| libs.iter().map(move |lib| (pkg.as_str(), lib.as_str())))
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }

    /// Drop every library of `package`.
    pub fn remove_package(&mut self, package: &str) -> Option<Vec<String>> {
        self.libraries.remove(package)
    }

    pub fn merge(&mut self, other: SharedLibraryInventory) {
        for (pkg, libs) in other.libraries {
            for lib in libs {
                self.add(&pkg, lib);
            }
        }
    }

    /// Total number of libraries.
    pub fn len(&self) -> usize {
        self.libraries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
