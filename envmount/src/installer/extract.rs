//! Archive extraction seam and conda package layout.
//!
//! Two package layouts are understood:
//!
//! ```text
//! foo-1.0-h0.tar.bz2          foo-1.0-h0.conda
//! ├── info/index.json         ├── info-foo-1.0-h0.tar.zst  ─extract_data─▶ index.json, ...
//! ├── info/...                └── pkg-foo-1.0-h0.tar.zst   ─extract_data─▶ lib/..., bin/...
//! └── lib/...
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::error::{InstallError, InstallResult};
use crate::BoxFuture;

/// Relative path → file contents for one package.
pub type ExtractedFileSet = BTreeMap<String, Bytes>;

/// Extraction failure reported by an [`Extractor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ExtractError {
    pub reason: String,
}

impl ExtractError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Downloads and decodes package archives.
pub trait Extractor: Send + Sync {
    /// Download `url` and unpack it.
    fn extract<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ExtractedFileSet, ExtractError>>;

    /// Unpack an archive already in memory.
    fn extract_data<'a>(&'a self, data: Bytes) -> BoxFuture<'a, Result<ExtractedFileSet, ExtractError>>;
}

/// Payload and metadata of a package.
#[derive(Debug, Default)]
pub struct PackageContents {
    /// Files under `info/`, with that prefix removed.
    pub info: ExtractedFileSet,
    /// Files to install.
    pub payload: ExtractedFileSet,
}

const INFO_DIR: &str = "info/";
const CONDA_SUFFIX: &str = ".conda";

/// Separate package metadata from the installable payload.
pub async fn split_package_info(
    filename: &str,
    files: ExtractedFileSet,
    extractor: &dyn Extractor,
) -> InstallResult<PackageContents> {
    if !filename.to_lowercase().ends_with(CONDA_SUFFIX) {
        let mut contents = PackageContents::default();
        for (path, data) in files {
            match path.strip_prefix(INFO_DIR) {
                Some(rest) => {
                    contents.info.insert(rest.to_string(), data);
                }
                None => {
                    contents.payload.insert(path, data);
                }
            }
        }
        return Ok(contents);
    }

    let mut inner_pkg = None;
    let mut inner_info = None;
    for (path, data) in files {
        if path.starts_with("pkg-") {
            inner_pkg = Some(data);
        } else if path.starts_with("info-") {
            inner_info = Some(data);
        }
    }

    let invalid = |reason: &str| InstallError::InvalidPackage {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };
    let inner_pkg = inner_pkg
        .filter(|d| !d.is_empty())
        .ok_or_else(|| invalid("missing or empty pkg archive"))?;
    let inner_info = inner_info
        .filter(|d| !d.is_empty())
        .ok_or_else(|| invalid("missing or empty info archive"))?;

    let extract_failed = |e: ExtractError| InstallError::Extract {
        source_name: filename.to_string(),
        reason: e.reason,
    };
    let payload = extractor
        .extract_data(inner_pkg)
        .await
        .map_err(extract_failed)?;
    let info = extractor
        .extract_data(inner_info)
        .await
        .map_err(extract_failed)?;
    Ok(PackageContents { info, payload })
}

#[derive(Debug, Serialize, Deserialize)]
struct CondaMetaRecord {
    name: String,
    version: String,
    build: String,
    #[serde(default)]
    build_number: Option<u64>,
}

/// The `conda-meta/<name>-<version>-<build>.json` record for a package.
///
/// A record shipped in the metadata is used as-is; otherwise one is built
/// from `index.json`. `None` when neither is present.
pub fn conda_meta_file(
    filename: &str,
    info: &ExtractedFileSet,
) -> InstallResult<Option<(String, Bytes)>> {
    if let Some((path, data)) = info.iter().find(|(path, _)| path.contains("conda-meta")) {
        return Ok(Some((path.clone(), data.clone())));
    }

    let Some(index) = info
        .iter()
        .find(|(path, _)| path.ends_with("index.json"))
        .map(|(_, data)| data)
    else {
        debug!(package = %filename, "no index.json, skipping conda-meta record");
        return Ok(None);
    };

    let record: CondaMetaRecord =
        serde_json::from_slice(index).map_err(|e| InstallError::InvalidPackage {
            filename: filename.to_string(),
            reason: format!("invalid index.json: {}", e),
        })?;
    let path = format!(
        "conda-meta/{}-{}-{}.json",
        record.name, record.version, record.build
    );
    let json = serde_json::to_vec(&record).map_err(|e| InstallError::InvalidPackage {
        filename: filename.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some((path, Bytes::from(json))))
}
