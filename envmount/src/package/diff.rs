//! Environment diffs and package tables.
//!
//! Packages are compared by name. A package whose version and build string
//! both match is unchanged and never shown.
//!
//! ```text
//!   Name                          Version                       Build ...
//! ────────────────────────────────────────────────────────────────────...
//! + numpy                         2.1.0                         py313h0 ...
//! ~ zlib                          1.2.13 -> 1.3.1               h0 -> h1 ...
//! - six                           1.16.0                        pyhd8_0 ...
//! ```

use std::collections::BTreeMap;

use super::resolved::{PackageMap, ResolvedPackage};

/// Width of every table column.
pub const COLUMN_WIDTH: usize = 30;

/// Printed when a diff has no visible rows.
pub const NOTHING_TO_DO: &str = "All requested packages already installed.";

const UNKNOWN_BUILD: &str = "unknown";

/// Kind of a rendered diff row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMarker {
    Added,
    Changed,
    Removed,
}

impl DiffMarker {
    pub fn symbol(&self) -> char {
        match self {
            Self::Added => '+',
            Self::Changed => '~',
            Self::Removed => '-',
        }
    }
}

/// One rendered row of a diff table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub marker: DiffMarker,
    pub text: String,
}

/// Differences between an installed and a newly resolved package set.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentDiff {
    pub added: Vec<ResolvedPackage>,
    /// `(installed, new)` pairs whose version or build differ.
    pub changed: Vec<(ResolvedPackage, ResolvedPackage)>,
    pub removed: Vec<ResolvedPackage>,
    pub unchanged: Vec<ResolvedPackage>,
}

fn by_name(packages: &PackageMap) -> BTreeMap<&str, &ResolvedPackage> {
    packages.values().map(|p| (p.name.as_str(), p)).collect()
}

impl EnvironmentDiff {
    /// Compare two package sets by name. Output lists are sorted by name.
    pub fn between(installed: &PackageMap, new: &PackageMap) -> Self {
        let old_by_name = by_name(installed);
        let new_by_name = by_name(new);
        let mut diff = Self::default();

        for (name, pkg) in &new_by_name {
            match old_by_name.get(name) {
                None => diff.added.push((*pkg).clone()),
                Some(prev)
                    if prev.version == pkg.version
                        && prev.build.build_string == pkg.build.build_string =>
                {
                    diff.unchanged.push((*pkg).clone())
                }
                Some(prev) => diff.changed.push(((*prev).clone(), (*pkg).clone())),
            }
        }
        for (name, pkg) in &old_by_name {
            if !new_by_name.contains_key(name) {
                diff.removed.push((*pkg).clone());
            }
        }
        diff
    }

    /// Whether nothing is added, changed or removed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Packages that must be installed: added plus the new side of changes.
    pub fn to_install(&self) -> Vec<ResolvedPackage> {
        self.added
            .iter()
            .cloned()
            .chain(self.changed.iter().map(|(_, new)| new.clone()))
            .collect()
    }

    /// Packages that must be uninstalled: removed plus the old side of changes.
    pub fn to_remove(&self) -> Vec<ResolvedPackage> {
        self.removed
            .iter()
            .cloned()
            .chain(self.changed.iter().map(|(old, _)| old.clone()))
            .collect()
    }

    /// Visible rows: additions and changes sorted by name, then removals.
    /// Removed packages from the Python package index are not shown.
    pub fn rows(&self) -> Vec<DiffRow> {
        let mut upserts: Vec<(&str, DiffRow)> = Vec::new();

        for pkg in &self.added {
            upserts.push((
                &pkg.name,
                row(
                    DiffMarker::Added,
                    &pkg.name,
                    &pkg.version,
                    pkg.build.build_string.as_deref().unwrap_or_default(),
                    pkg.build.channel.as_deref().unwrap_or_default(),
                ),
            ));
        }
        for (old, new) in &self.changed {
            let build = format!(
                "{} -> {}",
                old.build.build_string.as_deref().unwrap_or(UNKNOWN_BUILD),
                new.build.build_string.as_deref().unwrap_or(UNKNOWN_BUILD)
            );
            let channel = if old.build.channel == new.build.channel {
                new.build.channel.clone().unwrap_or_default()
            } else {
                format!(
                    "{} -> {}",
                    old.build.channel.as_deref().unwrap_or_default(),
                    new.build.channel.as_deref().unwrap_or_default()
                )
            };
            upserts.push((
                &new.name,
                row(
                    DiffMarker::Changed,
                    &new.name,
                    &format!("{} -> {}", old.version, new.version),
                    &build,
                    &channel,
                ),
            ));
        }
        upserts.sort_by(|a, b| a.0.cmp(b.0));

        let mut rows: Vec<DiffRow> = upserts.into_iter().map(|(_, r)| r).collect();
        rows.extend(self.removed.iter().filter(|p| !p.is_pip()).map(|pkg| {
            row(
                DiffMarker::Removed,
                &pkg.name,
                &pkg.version,
                pkg.build.build_string.as_deref().unwrap_or_default(),
                pkg.build.channel.as_deref().unwrap_or_default(),
            )
        }));
        rows
    }

    /// Render the diff as a plain-text table.
    pub fn render_table(&self) -> String {
        let rows = self.rows();
        if rows.is_empty() {
            return NOTHING_TO_DO.to_string();
        }
        let mut lines = vec![format!("  {}", header()), separator()];
        lines.extend(rows.into_iter().map(|r| r.text));
        lines.join("\n")
    }
}

fn header() -> String {
    columns(&["Name", "Version", "Build", "Channel"])
}

fn separator() -> String {
    "─".repeat(4 * COLUMN_WIDTH)
}

fn columns(cells: &[&str]) -> String {
    cells
        .iter()
        .map(|c| format!("{:<width$}", c, width = COLUMN_WIDTH))
        .collect()
}

fn row(marker: DiffMarker, name: &str, version: &str, build: &str, channel: &str) -> DiffRow {
    DiffRow {
        marker,
        text: format!(
            "{} {}",
            marker.symbol(),
            columns(&[name, version, build, channel])
        ),
    }
}

/// Render installed packages as a table sorted by name.
///
/// Returns an empty string for an empty set.
pub fn render_package_list(packages: &PackageMap) -> String {
    if packages.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&ResolvedPackage> = packages.values().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut lines = vec![header(), separator()];
    for pkg in sorted {
        lines.push(columns(&[
            &pkg.name,
            &pkg.version,
            pkg.build.build_string.as_deref().unwrap_or(UNKNOWN_BUILD),
            pkg.build.channel.as_deref().unwrap_or_default(),
        ]));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::resolved::{package_map, PIP_CHANNEL};

    fn pkg(name: &str, version: &str, build: &str) -> ResolvedPackage {
        ResolvedPackage::new(name, version, format!("{}-{}-{}.tar.bz2", name, version, build))
            .with_build_string(build)
            .with_channel("conda-forge")
    }

    #[test]
    fn test_between_classifies_by_name() {
        let installed = package_map([pkg("zlib", "1.2", "h0"), pkg("six", "1.16", "py_0"), pkg("xz", "5.4", "h0")]);
        let new = package_map([pkg("zlib", "1.3", "h1"), pkg("numpy", "2.1", "py313"), pkg("xz", "5.4", "h0")]);

        let diff = EnvironmentDiff::between(&installed, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "numpy");
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].0.version, "1.2");
        assert_eq!(diff.changed[0].1.version, "1.3");
        assert_eq!(diff.removed[0].name, "six");
        assert_eq!(diff.unchanged[0].name, "xz");

        let install: Vec<_> = diff.to_install().into_iter().map(|p| p.name).collect();
        assert_eq!(install, vec!["numpy", "zlib"]);
        let remove: Vec<_> = diff.to_remove().into_iter().map(|p| p.version).collect();
        assert_eq!(remove, vec!["1.16", "1.2"]);
    }

    #[test]
    fn test_build_change_alone_is_a_change() {
        let installed = package_map([pkg("zlib", "1.3", "h0")]);
        let new = package_map([pkg("zlib", "1.3", "h1")]);
        let diff = EnvironmentDiff::between(&installed, &new);
        assert_eq!(diff.changed.len(), 1);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_render_table_rows() {
        let installed = package_map([pkg("zlib", "1.2", "h0"), pkg("six", "1.16", "py_0")]);
        let new = package_map([pkg("zlib", "1.3", "h1"), pkg("numpy", "2.1", "py313")]);
        let table = EnvironmentDiff::between(&installed, &new).render_table();
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("  Name"));
        assert_eq!(lines[1].chars().count(), 4 * COLUMN_WIDTH);
        assert!(lines[2].starts_with("+ numpy"));
        assert!(lines[3].starts_with("~ zlib"));
        assert!(lines[3].contains("1.2 -> 1.3"));
        assert!(lines[3].contains("h0 -> h1"));
        assert!(lines[4].starts_with("- six"));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_channel_change_is_rendered() {
        let installed = package_map([pkg("zlib", "1.2", "h0")]);
        let new = package_map([pkg("zlib", "1.3", "h0").with_channel("emscripten-forge")]);
        let rows = EnvironmentDiff::between(&installed, &new).rows();
        assert!(rows[0].text.contains("conda-forge -> emscripten-forge"));
    }

    #[test]
    fn test_removed_pip_packages_are_hidden() {
        let installed = package_map([pkg("requests", "2.32", "").with_channel(PIP_CHANNEL)]);
        let diff = EnvironmentDiff::between(&installed, &PackageMap::new());
        assert_eq!(diff.removed.len(), 1);
        assert!(diff.rows().is_empty());
        assert_eq!(diff.render_table(), NOTHING_TO_DO);
    }

    #[test]
    fn test_unchanged_only_reports_nothing_to_do() {
        let set = package_map([pkg("xz", "5.4", "h0")]);
        let diff = EnvironmentDiff::between(&set, &set);
        assert!(diff.is_empty());
        assert_eq!(diff.render_table(), NOTHING_TO_DO);
    }

    #[test]
    fn test_render_package_list() {
        let set = package_map([
            pkg("zlib", "1.3", "h0"),
            ResolvedPackage::new("abc", "0.1", "abc-0.1.tar.bz2"),
        ]);
        let table = render_package_list(&set);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("Name"));
        assert!(lines[2].starts_with("abc"));
        assert!(lines[2].contains("unknown"));
        assert!(lines[3].starts_with("zlib"));
        assert_eq!(render_package_list(&PackageMap::new()), "");
    }
}
