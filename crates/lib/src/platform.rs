//! The seam between the installer and the kernel.
//!
//! Everything that queries filesystems, block devices or
//! device-mapper goes through [`Platform`], so that the install
//! state machine can be exercised without real devices.

use std::fs::File;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use gsid_blockdev::{BackingDevice, DeviceMapper, Dmsetup};

use crate::fiemap::Extent;

/// Space accounting for a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    /// Bytes available to unprivileged writers.
    pub free_bytes: u64,
    /// Size of the filesystem.
    pub total_bytes: u64,
}

impl FsUsage {
    /// Free space as a percentage of the filesystem size, for display.
    pub fn free_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.free_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// True if at least `percent`% of the filesystem is free. Exact, so a
    /// filesystem right at the threshold passes.
    pub fn has_free_percent(&self, percent: u32) -> bool {
        u128::from(self.free_bytes) * 100 >= u128::from(self.total_bytes) * u128::from(percent)
    }
}

/// Kernel and filesystem operations used by the installer.
pub trait Platform: Send + Sync + std::fmt::Debug {
    /// Space usage of the filesystem holding `dir`.
    fn filesystem_usage(&self, dir: &Utf8Path) -> Result<FsUsage>;

    /// The block device underneath the filesystem holding `path`.
    fn backing_device(&self, path: &Utf8Path) -> Result<BackingDevice>;

    /// Size of a block device in bytes.
    fn block_device_size(&self, path: &Utf8Path) -> Result<u64>;

    /// True if `dir` is on removable storage we know how to install to.
    fn is_external_storage(&self, dir: &Utf8Path) -> bool;

    /// Physical extents of `file`, which lives at `path`.
    fn file_extents(&self, path: &Utf8Path, file: &File) -> Result<Vec<Extent>>;

    /// Device-mapper control.
    fn device_mapper(&self) -> &dyn DeviceMapper;
}

/// The real [`Platform`] for Linux hosts.
#[derive(Debug)]
pub struct LinuxPlatform {
    external_storage_prefix: Utf8PathBuf,
    dm: Dmsetup,
}

impl LinuxPlatform {
    /// Create a platform treating paths under `external_storage_prefix`
    /// as candidate removable storage.
    pub fn new(external_storage_prefix: &Utf8Path) -> Self {
        Self {
            external_storage_prefix: external_storage_prefix.to_owned(),
            dm: Dmsetup,
        }
    }
}

impl Platform for LinuxPlatform {
    #[context("Reading filesystem stats for {dir}")]
    fn filesystem_usage(&self, dir: &Utf8Path) -> Result<FsUsage> {
        let st = rustix::fs::statvfs(dir.as_std_path())?;
        let free_bytes = st.f_bavail * st.f_frsize;
        let total_bytes = st.f_blocks * st.f_frsize;
        tracing::trace!("{dir}: {free_bytes} of {total_bytes} bytes free");
        Ok(FsUsage {
            free_bytes,
            total_bytes,
        })
    }

    fn backing_device(&self, path: &Utf8Path) -> Result<BackingDevice> {
        gsid_blockdev::backing_device_for_path(path)
    }

    fn block_device_size(&self, path: &Utf8Path) -> Result<u64> {
        gsid_blockdev::block_device_size(path)
    }

    fn is_external_storage(&self, dir: &Utf8Path) -> bool {
        if !dir.starts_with(&self.external_storage_prefix) {
            return false;
        }
        match rustix::fs::statfs(dir.as_std_path()) {
            Ok(st) => {
                tracing::debug!("{dir}: fs type {:#x}", st.f_type);
                st.f_type as i64 == libc::MSDOS_SUPER_MAGIC as i64
            }
            Err(e) => {
                tracing::error!("statfs {dir}: {e}");
                false
            }
        }
    }

    #[context("Reading extents of {path}")]
    fn file_extents(&self, path: &Utf8Path, file: &File) -> Result<Vec<Extent>> {
        crate::fiemap::file_extents(file)
    }

    fn device_mapper(&self) -> &dyn DeviceMapper {
        &self.dm
    }
}
