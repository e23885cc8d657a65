//! A [`Platform`] that needs no real block devices.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use gsid_blockdev::{BackingDevice, DeviceMapper, DmDeviceState, DmTable};

use crate::config::Config;
use crate::fiemap::Extent;
use crate::platform::{FsUsage, Platform};

const GIB: u64 = 1 << 30;

#[derive(Debug)]
struct State {
    usage: FsUsage,
    external: bool,
    devicemapper: bool,
    extent_size: u64,
    relocated: bool,
}

/// Device-mapper nodes are plain files under `mapper/`.
#[derive(Debug)]
pub(crate) struct FakeDm {
    dir: Utf8PathBuf,
    nodes: Mutex<BTreeMap<String, Utf8PathBuf>>,
}

impl FakeDm {
    fn nodes(&self) -> MutexGuard<'_, BTreeMap<String, Utf8PathBuf>> {
        self.nodes.lock().unwrap()
    }
}

impl DeviceMapper for FakeDm {
    fn create(&self, name: &str, table: &DmTable, _timeout: Duration) -> Result<Utf8PathBuf> {
        let mut nodes = self.nodes();
        if nodes.contains_key(name) {
            anyhow::bail!("{name} already exists");
        }
        let path = self.dir.join(name);
        let f = File::create(&path)?;
        f.set_len(table.num_sectors() * 512)?;
        nodes.insert(name.to_owned(), path.clone());
        Ok(path)
    }

    fn remove(&self, name: &str, _timeout: Duration) -> Result<()> {
        let path = self
            .nodes()
            .remove(name)
            .ok_or_else(|| anyhow::anyhow!("{name} does not exist"))?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn state(&self, name: &str) -> Result<DmDeviceState> {
        Ok(if self.nodes().contains_key(name) {
            DmDeviceState::Active
        } else {
            DmDeviceState::Invalid
        })
    }
}

/// Synthesizes extents from inode numbers, so that every file gets a
/// stable, distinct and sector-aligned physical location.
#[derive(Debug)]
pub(crate) struct FakePlatform {
    _td: tempfile::TempDir,
    root: Utf8PathBuf,
    state: Mutex<State>,
    dm: FakeDm,
}

impl FakePlatform {
    pub(crate) fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow::anyhow!("non-UTF-8 tempdir"))?
            .to_owned();
        for d in ["install", "metadata", "mapper", "media"] {
            std::fs::create_dir(root.join(d))?;
        }
        std::fs::write(root.join("userdata-dev"), vec![0u8; 8192])?;
        let dm = FakeDm {
            dir: root.join("mapper"),
            nodes: Default::default(),
        };
        Ok(Self {
            _td: td,
            root,
            state: Mutex::new(State {
                usage: FsUsage {
                    free_bytes: 60 * GIB,
                    total_bytes: 100 * GIB,
                },
                external: false,
                devicemapper: false,
                extent_size: 1 << 20,
                relocated: false,
            }),
            dm,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The default install directory.
    pub(crate) fn dir(&self) -> Utf8PathBuf {
        self.root.join("install")
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// A configuration pointing every path into the temporary directory.
    pub(crate) fn config(&self) -> Config {
        let root = self.root();
        Config {
            metadata_dir: root.join("metadata"),
            default_install_dir: format!("{}/", self.dir()).into(),
            data_root_alias: root.join("alias"),
            external_storage_prefix: format!("{root}/media/").into(),
            userdata_device: root.join("userdata-dev"),
            fstab: root.join("fstab"),
            default_userdata_size: 1 << 20,
            ..Default::default()
        }
    }

    pub(crate) fn set_usage(&self, free_bytes: u64, total_bytes: u64) {
        self.state().usage = FsUsage {
            free_bytes,
            total_bytes,
        };
    }

    pub(crate) fn set_external(&self, v: bool) {
        self.state().external = v;
    }

    pub(crate) fn set_devicemapper(&self, v: bool) {
        self.state().devicemapper = v;
    }

    pub(crate) fn set_extent_size(&self, v: u64) {
        self.state().extent_size = v;
    }

    pub(crate) fn set_relocated(&self, v: bool) {
        self.state().relocated = v;
    }

    pub(crate) fn dm_nodes(&self) -> Vec<String> {
        self.dm.nodes().keys().cloned().collect()
    }
}

impl Platform for FakePlatform {
    fn filesystem_usage(&self, _dir: &Utf8Path) -> Result<FsUsage> {
        Ok(self.state().usage)
    }

    fn backing_device(&self, _path: &Utf8Path) -> Result<BackingDevice> {
        Ok(BackingDevice {
            path: self.root.join("bdev"),
            is_devicemapper: self.state().devicemapper,
        })
    }

    fn block_device_size(&self, path: &Utf8Path) -> Result<u64> {
        if path.file_name() == Some("bdev") {
            return Ok(1 << 50);
        }
        Ok(std::fs::metadata(path)?.len())
    }

    fn is_external_storage(&self, _dir: &Utf8Path) -> bool {
        self.state().external
    }

    fn file_extents(&self, _path: &Utf8Path, file: &File) -> Result<Vec<Extent>> {
        let st = self.state();
        let meta = file.metadata()?;
        let len = meta.len().next_multiple_of(4096);
        let base = ((meta.ino() & 0xffff) + 1) << 32;
        let shift = if st.relocated { 4096 } else { 0 };
        let mut r = Vec::new();
        let mut logical = 0;
        while logical < len {
            let length = st.extent_size.min(len - logical);
            r.push(Extent {
                logical,
                physical: base + logical + shift,
                length,
            });
            logical += length;
        }
        Ok(r)
    }

    fn device_mapper(&self) -> &dyn DeviceMapper {
        &self.dm
    }
}
