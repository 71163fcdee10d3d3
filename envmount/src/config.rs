//! INI configuration file.
//!
//! ```ini
//! [environment]
//! prefix = /
//! pkg_root_url = https://example.org/pkgs
//! python_version = 3.13
//!
//! [stream]
//! block_size = superblock
//! first_sector_bytes = 4096
//! fetch_retries = 0
//! timeout_secs = 300
//! region_size_mb = 64
//!
//! [install]
//! mount_root = /squashfs
//! symlink_dir_fragments = /lib/python3.13/site-packages/
//! generate_conda_meta = false
//! ```
//!
//! Every key is optional. `symlink_dir_fragments` is a comma-separated list.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::bootstrap::BootstrapConfig;
use crate::installer::{InstallerConfig, DEFAULT_MOUNT_ROOT};
use crate::package::PythonVersion;
use crate::stream::{BlockSizing, StreamConfig, DEFAULT_FIRST_SECTOR_BYTES, DEFAULT_TIMEOUT_SECS};

/// Default shared region size in megabytes.
pub const DEFAULT_REGION_SIZE_MB: usize = 64;

const APP_DIR: &str = "envmount";
const CONFIG_FILE: &str = "config.ini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("failed to write config: {0}")]
    Write(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default config location: `<config dir>/envmount/config.ini`.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// `[environment]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSettings {
    pub prefix: String,
    pub pkg_root_url: String,
    pub python_version: Option<PythonVersion>,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            pkg_root_url: String::new(),
            python_version: None,
        }
    }
}

/// `[stream]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub block_size: BlockSizing,
    pub first_sector_bytes: u32,
    pub fetch_retries: u32,
    pub timeout_secs: u64,
    pub region_size_mb: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            block_size: BlockSizing::Superblock,
            first_sector_bytes: DEFAULT_FIRST_SECTOR_BYTES,
            fetch_retries: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            region_size_mb: DEFAULT_REGION_SIZE_MB,
        }
    }
}

/// `[install]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    pub mount_root: String,
    pub symlink_dir_fragments: Option<Vec<String>>,
    pub generate_conda_meta: bool,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            mount_root: DEFAULT_MOUNT_ROOT.to_string(),
            symlink_dir_fragments: None,
            generate_conda_meta: false,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub environment: EnvironmentSettings,
    pub stream: StreamSettings,
    pub install: InstallSettings,
}

struct Section<'a> {
    ini: &'a Ini,
    name: &'static str,
}

impl Section<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.ini
            .get_from(Some(self.name), key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key).map(str::to_string)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> ConfigResult<Option<T>> {
        self.raw(key)
            .map(|v| v.parse().map_err(|_| self.invalid(key, v)))
            .transpose()
    }

    fn boolean(&self, key: &str) -> ConfigResult<Option<bool>> {
        self.raw(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(self.invalid(key, v)),
            })
            .transpose()
    }

    fn block_size(&self, key: &str) -> ConfigResult<Option<BlockSizing>> {
        self.raw(key)
            .map(|v| {
                if v.eq_ignore_ascii_case("superblock") {
                    return Ok(BlockSizing::Superblock);
                }
                match v.parse::<u32>() {
                    Ok(n) if n > 0 => Ok(BlockSizing::Fixed(n)),
                    _ => Err(self.invalid(key, v)),
                }
            })
            .transpose()
    }
}

impl ConfigFile {
    /// Parse configuration text.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Load the file at [`default_path`], or defaults if there is none.
    pub fn load_default() -> ConfigResult<Self> {
        match default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn from_ini(ini: &Ini) -> ConfigResult<Self> {
        let mut config = Self::default();

        let env = Section {
            ini,
            name: "environment",
        };
        if let Some(prefix) = env.string("prefix") {
            config.environment.prefix = prefix;
        }
        if let Some(url) = env.string("pkg_root_url") {
            config.environment.pkg_root_url = url;
        }
        config.environment.python_version = env.parsed("python_version")?;

        let stream = Section {
            ini,
            name: "stream",
        };
        if let Some(sizing) = stream.block_size("block_size")? {
            config.stream.block_size = sizing;
        }
        if let Some(bytes) = stream.parsed("first_sector_bytes")? {
            config.stream.first_sector_bytes = bytes;
        }
        if let Some(retries) = stream.parsed("fetch_retries")? {
            config.stream.fetch_retries = retries;
        }
        if let Some(secs) = stream.parsed("timeout_secs")? {
            config.stream.timeout_secs = secs;
        }
        if let Some(mb) = stream.parsed::<usize>("region_size_mb")? {
            if mb == 0 {
                return Err(stream.invalid("region_size_mb", "0"));
            }
            config.stream.region_size_mb = mb;
        }

        let install = Section {
            ini,
            name: "install",
        };
        if let Some(root) = install.string("mount_root") {
            config.install.mount_root = root;
        }
        if let Some(list) = install.raw("symlink_dir_fragments") {
            config.install.symlink_dir_fragments = Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(enabled) = install.boolean("generate_conda_meta")? {
            config.install.generate_conda_meta = enabled;
        }

        Ok(config)
    }

    /// Render as INI text.
    pub fn to_ini_string(&self) -> ConfigResult<String> {
        let mut ini = Ini::new();
        let mut env = ini.with_section(Some("environment"));
        env.set("prefix", self.environment.prefix.as_str())
            .set("pkg_root_url", self.environment.pkg_root_url.as_str());
        if let Some(version) = self.environment.python_version {
            env.set("python_version", version.to_string());
        }

        let block_size = match self.stream.block_size {
            BlockSizing::Superblock => "superblock".to_string(),
            BlockSizing::Fixed(n) => n.to_string(),
        };
        ini.with_section(Some("stream"))
            .set("block_size", block_size)
            .set("first_sector_bytes", self.stream.first_sector_bytes.to_string())
            .set("fetch_retries", self.stream.fetch_retries.to_string())
            .set("timeout_secs", self.stream.timeout_secs.to_string())
            .set("region_size_mb", self.stream.region_size_mb.to_string());

        let mut install = ini.with_section(Some("install"));
        install
            .set("mount_root", self.install.mount_root.as_str())
            .set(
                "generate_conda_meta",
                self.install.generate_conda_meta.to_string(),
            );
        if let Some(fragments) = &self.install.symlink_dir_fragments {
            install.set("symlink_dir_fragments", fragments.join(","));
        }

        let mut out = Vec::new();
        ini.write_to(&mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Streaming cache settings.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::default()
            .with_block_size(self.stream.block_size)
            .with_first_sector_bytes(self.stream.first_sector_bytes)
            .with_fetch_retries(self.stream.fetch_retries)
            .with_timeout(Duration::from_secs(self.stream.timeout_secs))
    }

    /// Installer settings.
    pub fn installer_config(&self) -> InstallerConfig {
        let mut config = InstallerConfig::default()
            .with_prefix(self.environment.prefix.as_str())
            .with_pkg_root_url(self.environment.pkg_root_url.as_str())
            .with_mount_root(self.install.mount_root.as_str())
            .with_generate_conda_meta(self.install.generate_conda_meta);
        if let Some(fragments) = &self.install.symlink_dir_fragments {
            config = config.with_symlink_dir_fragments(fragments.clone());
        }
        if let Some(version) = self.environment.python_version {
            config = config.with_python_version(version);
        }
        config
    }

    /// Full bootstrap settings.
    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig::default()
            .with_installer(self.installer_config())
            .with_stream(self.stream_config())
            .with_region_size(self.stream.region_size_mb * 1024 * 1024)
    }
}
