//! Record of every path installed per package.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::package::ResolvedPackage;

/// Map package filename → (path relative to the prefix → absolute path).
///
/// Only files and symlinks are recorded. Directories created as shared
/// scaffolding belong to no package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledPathManifest {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl InstalledPathManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one installed path for `filename`.
    pub fn record(&mut self, filename: &str, relative: impl Into<String>, absolute: impl Into<String>) {
        self.entries
            .entry(filename.to_string())
            .or_default()
            .insert(relative.into(), absolute.into());
    }

    /// Make sure `filename` has an entry, even an empty one.
    pub fn touch(&mut self, filename: &str) {
        self.entries.entry(filename.to_string()).or_default();
    }

    /// Recorded paths for `filename`.
    pub fn paths(&self, filename: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.contains_key(filename)
    }

    /// Whether any entry records `absolute`.
    pub fn contains_path(&self, absolute: &str) -> bool {
        self.entries
            .values()
            .any(|paths| paths.values().any(|p| p == absolute))
    }

    /// Key of the entry recorded for `package`.
    ///
    /// Tries the exact filename first. A package resolved again may carry a
    /// different archive extension, so the fallback is the first key that
    /// is `name-version-build`, alone or followed by an extension.
    pub fn find_key(&self, package: &ResolvedPackage) -> Option<String> {
        if self.entries.contains_key(&package.filename) {
            return Some(package.filename.clone());
        }
        let identity = package.identity();
        self.entries
            .keys()
            .find(|key| {
                key.strip_prefix(identity.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
            })
            .cloned()
    }

    /// Drop an entry and return its paths.
    pub fn remove(&mut self, filename: &str) -> Option<BTreeMap<String, String>> {
        self.entries.remove(filename)
    }

    /// Move every entry of `other` into this manifest.
    pub fn merge(&mut self, other: InstalledPathManifest) {
        for (filename, paths) in other.entries {
            self.entries.entry(filename).or_default().extend(paths);
        }
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
