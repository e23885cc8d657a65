//! # Durable boot status
//!
//! The state of an install that must survive a reboot is kept in five
//! small files in the metadata directory:
//!
//! - `install_status`: present once an install is complete. Holds `ok`,
//!   `disabled`, `wipe`, or the number of boot attempts made so far.
//! - `lp_metadata`: the exported partition table.
//! - `one_shot_boot`: present if the install should only boot once.
//! - `install_dir`: the directory holding the image files.
//! - `booted`: present while the installed image is the running system.
//!
//! Each file is replaced atomically and synced. During finalization
//! `install_status` is written last, so that an interrupted install
//! never looks bootable.

use std::fmt::Display;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::metadata::PartitionMetadata;

const INSTALL_STATUS: &str = "install_status";
const LP_METADATA: &str = "lp_metadata";
const ONE_SHOT_BOOT: &str = "one_shot_boot";
const INSTALL_DIR: &str = "install_dir";
const BOOTED: &str = "booted";

const STATUS_OK: &str = "ok";
const STATUS_DISABLED: &str = "disabled";
const STATUS_WIPE: &str = "wipe";

/// The content of the install status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    /// Booted successfully at least once; boots without limit.
    Ok,
    /// Will not boot until re-enabled.
    Disabled,
    /// Will be removed at the next boot of the host system.
    Wipe,
    /// Not yet booted successfully, after this many attempts.
    Attempts(u32),
    /// Anything else.
    Other(String),
}

impl InstallStatus {
    fn parse(s: &str) -> Self {
        match s.trim() {
            STATUS_OK => Self::Ok,
            STATUS_DISABLED => Self::Disabled,
            STATUS_WIPE => Self::Wipe,
            s => match s.parse() {
                Ok(n) => Self::Attempts(n),
                Err(_) => Self::Other(s.to_owned()),
            },
        }
    }
}

impl Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str(STATUS_OK),
            Self::Disabled => f.write_str(STATUS_DISABLED),
            Self::Wipe => f.write_str(STATUS_WIPE),
            Self::Attempts(n) => write!(f, "{n}"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Why an installed image will not be booted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootRefusal {
    /// Nothing is installed.
    NotDetected,
    /// The install failed to boot too many times.
    ExceededMaxAttempts,
    /// The status does not allow booting; holds the status.
    NotEnabled(String),
}

impl Display for BootRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDetected => f.write_str("not detected"),
            Self::ExceededMaxAttempts => f.write_str("exceeded max boot attempts"),
            Self::NotEnabled(_) => f.write_str("not enabled"),
        }
    }
}

/// The verdict of first-stage boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDecision {
    /// Boot the installed image described by the metadata at this path.
    Boot(Utf8PathBuf),
    /// Boot the host system.
    DoNotBoot(BootRefusal),
}

/// Summary of the install for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootStatus {
    /// No install.
    NotInstalled,
    /// Boots until disabled.
    Enabled,
    /// Boots once.
    SingleBoot,
    /// Does not boot.
    Disabled,
    /// Will be removed.
    WillWipe,
}

/// Access to the durable boot status files.
#[derive(Debug)]
pub struct BootStatusStore {
    path: Utf8PathBuf,
    dir: Dir,
}

impl BootStatusStore {
    /// Open the store at `path`, creating the directory if needed.
    #[context("Opening boot status in {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self {
            path: path.to_owned(),
            dir,
        })
    }

    /// The directory holding the files.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Where the partition table is stored.
    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.path.join(LP_METADATA)
    }

    /// Replace `name` with `contents`, durably.
    fn write_synced(&self, name: &str, contents: &[u8]) -> Result<()> {
        let mut f = cap_tempfile::TempFile::new(&self.dir)?;
        f.write_all(contents)?;
        f.as_file().sync_all()?;
        f.replace(name)
            .with_context(|| format!("Replacing {}/{name}", self.path))?;
        rustix::fs::fsync(&self.dir).context("Syncing directory")?;
        Ok(())
    }

    fn read_optional(&self, name: &str) -> Result<Option<String>> {
        match self.dir.read_to_string(name) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {}/{name}", self.path)),
        }
    }

    fn remove_optional(&self, name: &str) -> Result<bool> {
        self.dir
            .remove_file_optional(name)
            .with_context(|| format!("Removing {}/{name}", self.path))
    }

    /// True if an install is complete.
    pub fn is_installed(&self) -> Result<bool> {
        Ok(self.dir.try_exists(INSTALL_STATUS)?)
    }

    /// True if the installed image is the running system.
    pub fn is_running(&self) -> Result<bool> {
        Ok(self.dir.try_exists(BOOTED)?)
    }

    /// True if the install is set to boot only once.
    pub fn is_one_shot(&self) -> Result<bool> {
        Ok(self.dir.try_exists(ONE_SHOT_BOOT)?)
    }

    /// The install status, if installed.
    pub fn status(&self) -> Result<Option<InstallStatus>> {
        Ok(self
            .read_optional(INSTALL_STATUS)?
            .map(|s| InstallStatus::parse(&s)))
    }

    /// Replace the install status.
    #[context("Setting install status to {status}")]
    pub fn set_status(&self, status: &InstallStatus) -> Result<()> {
        self.write_synced(INSTALL_STATUS, status.to_string().as_bytes())
    }

    /// Set or clear the one-shot marker.
    #[context("Setting boot mode")]
    pub fn set_one_shot(&self, one_shot: bool) -> Result<()> {
        if one_shot {
            self.write_synced(ONE_SHOT_BOOT, b"1")
        } else {
            self.remove_optional(ONE_SHOT_BOOT).map(drop)
        }
    }

    /// Read the stored partition table.
    #[context("Reading partition metadata")]
    pub fn read_metadata(&self) -> Result<PartitionMetadata> {
        let buf = self.dir.read_to_string(LP_METADATA)?;
        PartitionMetadata::from_json(&buf)
    }

    /// Store the partition table.
    #[context("Writing partition metadata")]
    pub fn write_metadata(&self, metadata: &PartitionMetadata) -> Result<()> {
        self.write_synced(LP_METADATA, metadata.to_json()?.as_bytes())
    }

    /// The recorded install directory.
    pub fn install_dir(&self) -> Result<Option<Utf8PathBuf>> {
        Ok(self
            .read_optional(INSTALL_DIR)?
            .map(|s| s.trim().into())
            .filter(|p: &Utf8PathBuf| !p.as_str().is_empty()))
    }

    /// The recorded install directory, or `default` if none is recorded.
    pub fn installed_image_dir(&self, default: &Utf8Path) -> Result<Utf8PathBuf> {
        Ok(self.install_dir()?.unwrap_or_else(|| default.to_owned()))
    }

    /// Record a finished install. The status is written last.
    #[context("Committing install")]
    pub fn commit_install(
        &self,
        install_dir: &Utf8Path,
        metadata: &PartitionMetadata,
        one_shot: bool,
    ) -> Result<()> {
        self.write_synced(INSTALL_DIR, install_dir.as_str().as_bytes())?;
        self.write_metadata(metadata)?;
        self.set_one_shot(one_shot)?;
        self.set_status(&InstallStatus::Attempts(0))?;
        tracing::debug!("Install in {install_dir} committed (one_shot={one_shot})");
        Ok(())
    }

    /// Make a disabled install bootable again, replacing the stored
    /// table if `metadata` is given.
    #[context("Re-enabling install")]
    pub fn reenable(
        &self,
        metadata: Option<&PartitionMetadata>,
        status: &InstallStatus,
        one_shot: bool,
    ) -> Result<()> {
        if let Some(md) = metadata {
            self.write_metadata(md)?;
        }
        self.set_one_shot(one_shot)?;
        self.set_status(status)
    }

    /// Remove every file except the running marker. The status goes
    /// first, so a partial removal is never bootable. A file that cannot
    /// be removed does not stop the rest; the first error is returned.
    #[context("Removing boot status")]
    pub fn remove_all(&self) -> Result<()> {
        self.remove_optional(INSTALL_STATUS)?;
        let mut first_err = None;
        for name in [LP_METADATA, ONE_SHOT_BOOT, INSTALL_DIR] {
            if let Err(e) = self.remove_optional(name) {
                tracing::warn!("{e:#}");
                first_err.get_or_insert(e);
            }
        }
        rustix::fs::fsync(&self.dir).context("Syncing directory")?;
        first_err.map_or(Ok(()), Err)
    }

    /// Mark the installed image as the running system.
    pub fn mark_running(&self) -> Result<()> {
        self.write_synced(BOOTED, b"1")
    }

    /// Clear the running marker.
    pub fn clear_running(&self) -> Result<()> {
        self.remove_optional(BOOTED).map(drop)
    }

    /// Decide whether to boot the installed image, consuming one boot
    /// attempt if so. The running marker is always cleared first.
    #[context("Deciding whether to boot")]
    pub fn boot_decision(&self, max_attempts: u32) -> Result<BootDecision> {
        self.clear_running()?;
        let Some(status) = self.status()? else {
            return Ok(BootDecision::DoNotBoot(BootRefusal::NotDetected));
        };
        match status {
            InstallStatus::Ok => {}
            InstallStatus::Attempts(n) => {
                if n.saturating_add(1) > max_attempts {
                    return Ok(BootDecision::DoNotBoot(BootRefusal::ExceededMaxAttempts));
                }
                let next = if self.is_one_shot()? {
                    InstallStatus::Disabled
                } else {
                    InstallStatus::Attempts(n + 1)
                };
                self.set_status(&next)?;
            }
            other => {
                return Ok(BootDecision::DoNotBoot(BootRefusal::NotEnabled(
                    other.to_string(),
                )))
            }
        }
        Ok(BootDecision::Boot(self.metadata_path()))
    }

    /// Summarize the install status.
    pub fn boot_status(&self) -> Result<BootStatus> {
        let Some(status) = self.status()? else {
            return Ok(BootStatus::NotInstalled);
        };
        let one_shot = self.is_one_shot()?;
        let r = match status {
            InstallStatus::Wipe => BootStatus::WillWipe,
            InstallStatus::Disabled if one_shot => BootStatus::SingleBoot,
            InstallStatus::Disabled => BootStatus::Disabled,
            _ if one_shot => BootStatus::SingleBoot,
            _ => BootStatus::Enabled,
        };
        Ok(r)
    }
}
