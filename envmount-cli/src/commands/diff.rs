//! Lock file diff and listing commands.

use std::path::Path;

use console::style;
use envmount::package::{
    render_package_list, DiffMarker, DiffRow, EnvironmentDiff, EnvironmentLock, NOTHING_TO_DO,
};

use crate::error::CliError;

/// Color a diff row by its marker.
fn styled(row: &DiffRow) -> String {
    match row.marker {
        DiffMarker::Added => style(&row.text).green().to_string(),
        DiffMarker::Changed => style(&row.text).yellow().to_string(),
        DiffMarker::Removed => style(&row.text).red().to_string(),
    }
}

/// Print the changes between two lock files.
pub fn run_diff(old: &Path, new: &Path) -> Result<(), CliError> {
    let installed = EnvironmentLock::load(old)?.resolved_packages();
    let resolved = EnvironmentLock::load(new)?.resolved_packages();
    let diff = EnvironmentDiff::between(&installed, &resolved);

    let rows = diff.rows();
    if rows.is_empty() {
        println!("{}", NOTHING_TO_DO);
        return Ok(());
    }

    // Header and separator come from the plain rendering.
    let table = diff.render_table();
    for line in table.lines().take(2) {
        println!("{}", style(line).bold());
    }
    for row in &rows {
        println!("{}", styled(row));
    }
    println!();
    println!(
        "{} added, {} changed, {} removed",
        diff.added.len(),
        diff.changed.len(),
        diff.removed.len()
    );
    Ok(())
}

/// Print the packages of a lock file.
pub fn run_packages(lock: &Path) -> Result<(), CliError> {
    let lock = EnvironmentLock::load(lock)?;
    let packages = lock.resolved_packages();
    if packages.is_empty() {
        println!("No packages.");
        return Ok(());
    }
    println!("Prefix: {}", lock.prefix);
    println!("{}", render_package_list(&packages));
    println!();
    println!("{} packages", packages.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lock(dir: &Path, name: &str, json: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_diff_and_packages_read_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_lock(
            dir.path(),
            "old.json",
            r#"{"prefix":"/","packages":[{"name":"zlib","version":"1.2","build":"h0","filename":"zlib-1.2-h0.tar.bz2"}]}"#,
        );
        let new = write_lock(
            dir.path(),
            "new.json",
            r#"{"prefix":"/","packages":[{"name":"zlib","version":"1.3","build":"h0","filename":"zlib-1.3-h0.tar.bz2"}]}"#,
        );

        assert!(run_diff(&old, &new).is_ok());
        assert!(run_diff(&old, &old).is_ok());
        assert!(run_packages(&new).is_ok());
    }

    #[test]
    fn test_missing_lock_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            run_packages(&missing),
            Err(CliError::Lock(_))
        ));
    }

    #[test]
    fn test_rows_are_colored_by_marker() {
        let row = DiffRow {
            marker: DiffMarker::Removed,
            text: "- zlib".to_string(),
        };
        assert!(styled(&row).contains("zlib"));
    }
}
