//! Shared-library metadata command.

use std::path::Path;

use envmount::dynload::parse_dylink;

use crate::error::CliError;

/// Print the dylink section of a library.
pub fn run(file: &Path) -> Result<(), CliError> {
    let path = file.display().to_string();
    let bytes = std::fs::read(file).map_err(|e| CliError::Read {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let info = parse_dylink(&bytes).map_err(|source| CliError::Dylink {
        path: path.clone(),
        source,
    })?;

    println!("{}", path);
    println!("  Memory size:  {} (align 2^{})", info.memory_size, info.memory_align);
    println!("  Table size:   {} (align 2^{})", info.table_size, info.table_align);
    if info.needed.is_empty() {
        println!("  Needed:       (none)");
    } else {
        println!("  Needed:");
        for lib in &info.needed {
            println!("    {}", lib);
        }
    }
    Ok(())
}
