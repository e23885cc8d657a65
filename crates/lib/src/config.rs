//! # Service configuration
//!
//! Configuration is read from a TOML file (by default
//! `/etc/gsid/config.toml`). Every key is optional; a missing file
//! is the same as an empty one.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// The default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gsid/config.toml";

const GIB: u64 = 1 << 30;

/// Which uids may call which operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AccessConfig {
    /// Callers allowed to perform every operation.
    pub system_uids: Vec<u32>,
    /// Callers additionally allowed to perform maintenance operations.
    pub shell_uids: Vec<u32>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            system_uids: vec![0, 1000],
            shell_uids: vec![2000],
        }
    }
}

/// The service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    /// Directory holding the durable boot-status files.
    pub metadata_dir: Utf8PathBuf,
    /// Where images are installed when no directory is requested.
    pub default_install_dir: Utf8PathBuf,
    /// A directory name accepted as a synonym for the default.
    pub data_root_alias: Utf8PathBuf,
    /// Removable storage is mounted under this prefix.
    pub external_storage_prefix: Utf8PathBuf,
    /// The raw block device holding the data filesystem.
    pub userdata_device: Utf8PathBuf,
    /// The fstab consulted before installing to removable storage.
    pub fstab: Utf8PathBuf,
    /// The mount point whose fstab entry is checked.
    pub system_mount_point: Utf8PathBuf,
    /// Minimum percentage of the filesystem that must be free.
    pub min_free_space_percent: u32,
    /// Maximum number of extents an image may be made of.
    pub max_extents: u64,
    /// Size of the userdata image when the caller asks for 0.
    pub default_userdata_size: u64,
    /// Largest file piece created on removable (vfat) storage.
    pub max_piece_size: u64,
    /// Number of attempts allowed to boot a fresh install.
    pub max_boot_attempts: u32,
    /// How long to wait for device-mapper nodes, in milliseconds.
    pub dm_timeout_ms: u64,
    /// Whether new installs may be started.
    pub install_enabled: bool,
    /// Whether the userdata image may be wiped.
    pub wipe_enabled: bool,
    /// Caller access control.
    pub access: AccessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_dir: "/metadata/gsi/dsu".into(),
            default_install_dir: "/data/gsi/dsu/".into(),
            data_root_alias: "/data/gsi".into(),
            external_storage_prefix: "/mnt/media_rw/".into(),
            userdata_device: "/dev/block/by-name/userdata".into(),
            fstab: "/etc/fstab".into(),
            system_mount_point: "/system".into(),
            min_free_space_percent: 40,
            max_extents: 512,
            default_userdata_size: 8 * GIB,
            max_piece_size: 4 * GIB - 4096,
            max_boot_attempts: 1,
            dm_timeout_ms: 5000,
            install_enabled: true,
            wipe_enabled: true,
            access: AccessConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration from `path`, or from the default location.
    #[context("Loading configuration")]
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let path = path.unwrap_or(Utf8Path::new(DEFAULT_CONFIG_PATH));
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration found at {path}");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let config = Self::parse(&buf).with_context(|| format!("Parsing {path}"))?;
        tracing::debug!("Loaded configuration from {path}");
        Ok(config)
    }

    /// Parse a configuration from TOML text.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The device-mapper timeout as a [`Duration`].
    pub fn dm_timeout(&self) -> Duration {
        Duration::from_millis(self.dm_timeout_ms)
    }
}
