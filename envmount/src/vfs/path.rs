//! Helpers for absolute `/`-separated paths.

/// Normalize to an absolute path without `.`, `..` or repeated slashes.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join `rest` under `base`. An absolute `rest` still lands under `base`.
pub fn join(base: &str, rest: &str) -> String {
    normalize(&format!("{}/{}", base, rest))
}

/// Parent of a normalized path; the root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a normalized path; empty for the root.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
