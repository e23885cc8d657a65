//! # Installing an image
//!
//! An [`InstallSession`] drives one install from parameter validation to
//! a bootable image:
//!
//! 1. Validate the parameters and check free space.
//! 2. Preallocate the `userdata_gsi` and `system_gsi` images.
//! 3. Decide how to write: through the image files directly, or, when
//!    the filesystem sits on a device-mapper stack, through a new
//!    device-mapper node mapping the image's extents.
//! 4. Format userdata if it was freshly allocated.
//! 5. Receive the system image in chunks.
//! 6. Finalize: verify the extents did not move and commit the boot
//!    status.
//!
//! Any failure along the way removes what this attempt created, as does
//! dropping a session that never finished. A session is also used to
//! recover an existing install from its stored partition table, for
//! re-enabling it or wiping its userdata.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use gsid_blockdev::DmDeviceState;

use crate::boot_status::{BootStatusStore, InstallStatus};
use crate::config::Config;
use crate::error::{InstallError, InstallResult};
use crate::image::{self, SplitImage};
use crate::metadata::{self, ImageLayout, PartitionMetadata, SECTOR_SIZE};
use crate::platform::Platform;
use crate::progress::{ProgressStatus, ProgressTracker};
use crate::writer::{BlockDeviceWriter, PartitionWriter};

/// Partition name of the system image.
pub const SYSTEM_NAME: &str = "system_gsi";
/// Partition name of the userdata image.
pub const USERDATA_NAME: &str = "userdata_gsi";

/// Bytes zeroed to format a fresh userdata image.
const USERDATA_FORMAT_SIZE: u64 = 4096;
/// Bytes zeroed to wipe an installed userdata image.
const USERDATA_WIPE_SIZE: u64 = 1 << 20;

/// State shared by the service and its sessions. Progress and the abort
/// flag are read and written without holding the session lock.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) store: BootStatusStore,
    pub(crate) progress: ProgressTracker,
    pub(crate) abort: AtomicBool,
}

/// What a caller asks to install.
#[derive(Debug, Clone, Default)]
pub struct InstallParams {
    /// Size of the system image in bytes.
    pub gsi_size: i64,
    /// Size of the userdata image in bytes; 0 reuses an existing image,
    /// or allocates the default size.
    pub userdata_size: i64,
    /// Discard any existing userdata image.
    pub wipe_userdata: bool,
    /// Where to put the images; the default directory if unset.
    pub install_dir: Option<Utf8PathBuf>,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Nothing in progress.
    Idle,
    /// Checking parameters and free space.
    Validating,
    /// Allocating image files.
    Preallocating,
    /// Images are allocated and the write path chosen.
    WritingMethodSelected,
    /// Zeroing the start of a fresh userdata image.
    FormattingAuxiliary,
    /// Accepting system image contents.
    ReceivingPayload,
    /// The install is complete and bootable.
    Finalized,
    /// Cancelled.
    Aborted,
    /// Failed and rolled back.
    Failed,
}

/// One image being built, with its logical size. The device, if any,
/// is a device-mapper node mapping the image.
#[derive(Debug)]
struct Image {
    file: SplitImage,
    actual_size: u64,
    device: Option<BlockDeviceWriter>,
}

impl Image {
    fn writer(&mut self) -> &mut dyn PartitionWriter {
        match &mut self.device {
            Some(d) => d as &mut dyn PartitionWriter,
            None => &mut self.file,
        }
    }
}

/// The index file of image `name` in `install_dir`.
pub(crate) fn image_path(install_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    install_dir.join(format!("{name}.img"))
}

fn with_trailing_slash(p: &Utf8Path) -> Utf8PathBuf {
    let mut s = p.as_str().to_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s.into()
}

fn canonicalize(dir: &Utf8Path) -> InstallResult<Utf8PathBuf> {
    let p = dir
        .canonicalize_utf8()
        .map_err(|e| InstallError::invalid(format!("Cannot access {dir}: {e}")))?;
    Ok(with_trailing_slash(&p))
}

/// Resolve the requested install directory. Returns the canonical
/// directory, with a trailing slash, and whether it is removable storage.
fn validate_install_dir(
    shared: &Shared,
    requested: Option<&Utf8Path>,
) -> InstallResult<(Utf8PathBuf, bool)> {
    let config = &shared.config;
    let default = &config.default_install_dir;
    let alias = config.data_root_alias.as_str().trim_end_matches('/');
    std::fs::create_dir_all(default).with_context(|| format!("Creating {default}"))?;
    let default = canonicalize(default)?;
    let dir = match requested {
        None => return Ok((default, false)),
        Some(d) if d.as_str().is_empty() || d.as_str().trim_end_matches('/') == alias => {
            return Ok((default, false))
        }
        Some(d) => canonicalize(d)?,
    };
    if dir == default {
        return Ok((dir, false));
    }
    if !shared.platform.is_external_storage(&dir) {
        return Err(InstallError::invalid(format!(
            "Cannot install to {dir}: not the default directory or removable storage"
        )));
    }
    if crate::fstab::uses_check_at_most_once(&config.fstab, &config.system_mount_point)? {
        return Err(InstallError::invalid(
            "Cannot install to removable storage when the system partition uses check_at_most_once",
        ));
    }
    Ok((dir, true))
}

fn sector_aligned(v: i64, what: &str) -> InstallResult<u64> {
    let v = u64::try_from(v)
        .map_err(|_| InstallError::invalid(format!("{what} must be non-negative")))?;
    if v % SECTOR_SIZE != 0 {
        return Err(InstallError::invalid(format!(
            "{what} {v} is not a multiple of {SECTOR_SIZE}"
        )));
    }
    Ok(v)
}

/// An install in progress, or a recovered complete install.
#[derive(Debug)]
pub struct InstallSession {
    shared: Arc<Shared>,
    state: InstallState,
    install_dir: Utf8PathBuf,
    external: bool,
    gsi_size: u64,
    userdata_size: u64,
    wipe_userdata: bool,
    format_userdata: bool,
    use_dm: bool,
    bytes_written: u64,
    images: BTreeMap<&'static str, Image>,
    metadata: Option<PartitionMetadata>,
    /// Images created by this session, removed again if it fails.
    created: Vec<&'static str>,
}

impl InstallSession {
    fn new(shared: Arc<Shared>, install_dir: Utf8PathBuf, external: bool) -> Self {
        Self {
            shared,
            state: InstallState::Idle,
            install_dir,
            external,
            gsi_size: 0,
            userdata_size: 0,
            wipe_userdata: false,
            format_userdata: false,
            use_dm: false,
            bytes_written: 0,
            images: BTreeMap::new(),
            metadata: None,
            created: Vec::new(),
        }
    }

    /// Start an install. On success the session is ready to receive the
    /// system image; on failure everything created has been removed.
    pub(crate) fn begin(shared: Arc<Shared>, params: &InstallParams) -> InstallResult<Self> {
        let (install_dir, external) =
            validate_install_dir(&shared, params.install_dir.as_deref())?;
        let mut s = Self::new(shared, install_dir, external);
        s.state = InstallState::Validating;
        match s.start(params) {
            Ok(()) => {
                s.state = InstallState::ReceivingPayload;
                tracing::info!(
                    "Installing to {} ({} bytes, userdata {} bytes, dm={})",
                    s.install_dir,
                    s.gsi_size,
                    s.userdata_size,
                    s.use_dm
                );
                Ok(s)
            }
            Err(e) => {
                s.state = match e {
                    InstallError::Cancelled => InstallState::Aborted,
                    _ => InstallState::Failed,
                };
                s.rollback();
                Err(e)
            }
        }
    }

    fn start(&mut self, params: &InstallParams) -> InstallResult<()> {
        self.sanity_checks(params)?;
        self.remove_previous_install()?;
        self.state = InstallState::Preallocating;
        self.preallocate()?;
        self.determine_write_method()?;
        self.metadata = Some(self.build_metadata()?);
        self.state = InstallState::WritingMethodSelected;
        if self.format_userdata {
            self.state = InstallState::FormattingAuxiliary;
            self.zero_userdata(USERDATA_FORMAT_SIZE)?;
        }
        self.open_partition(SYSTEM_NAME)?;
        self.shared.progress.start("write system", self.gsi_size);
        Ok(())
    }

    fn sanity_checks(&mut self, params: &InstallParams) -> InstallResult<()> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        self.gsi_size = sector_aligned(params.gsi_size, "Image size")?;
        self.userdata_size = sector_aligned(params.userdata_size, "Userdata size")?;
        self.wipe_userdata = params.wipe_userdata;
        if self.gsi_size == 0 {
            return Err(InstallError::invalid("Image size must not be zero"));
        }
        if shared.store.is_running()? {
            return Err(InstallError::invalid(
                "Cannot install while running an installed image",
            ));
        }
        // Counted in full even when an existing userdata image is reused.
        let userdata = match self.userdata_size {
            0 => config.default_userdata_size,
            n => n,
        };
        let required = self.gsi_size.saturating_add(userdata);
        let usage = shared.platform.filesystem_usage(&self.install_dir)?;
        if usage.free_bytes <= required {
            return Err(InstallError::InsufficientSpace {
                available: usage.free_bytes,
                required,
            });
        }
        if !usage.has_free_percent(config.min_free_space_percent) {
            return Err(InstallError::FileSystemCluttered(format!(
                "{:.1}% of the filesystem is free, at least {}% is required",
                usage.free_percent(),
                config.min_free_space_percent
            )));
        }
        Ok(())
    }

    fn image_path(&self, name: &str) -> Utf8PathBuf {
        image_path(&self.install_dir, name)
    }

    /// Make any previous install unbootable and drop its system image.
    #[context("Removing previous install")]
    fn remove_previous_install(&mut self) -> Result<()> {
        self.shared.store.remove_all()?;
        SplitImage::remove_all(&self.image_path(SYSTEM_NAME))
    }

    fn create_image(&mut self, name: &'static str, size: u64) -> InstallResult<SplitImage> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let max_piece_size = if self.external {
            config.max_piece_size
        } else {
            u64::MAX
        };
        let path = self.image_path(name);
        shared.progress.start(&format!("create {name}"), size);
        let mut progress = |done: u64, _total: u64| {
            shared.progress.update(ProgressStatus::Working, done);
            !shared.abort.load(Ordering::SeqCst)
        };
        self.created.push(name);
        let file = image::create_or_open(
            shared.platform.as_ref(),
            &path,
            size,
            max_piece_size,
            config.max_extents,
            &mut progress,
        )?;
        shared.progress.update(ProgressStatus::Complete, size);
        Ok(file)
    }

    fn preallocate(&mut self) -> InstallResult<()> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let userdata_path = self.image_path(USERDATA_NAME);
        let userdata = if self.wipe_userdata || !SplitImage::exists(&userdata_path)? {
            SplitImage::remove_all(&userdata_path)?;
            if self.userdata_size == 0 {
                self.userdata_size = config.default_userdata_size;
            }
            self.format_userdata = true;
            self.create_image(USERDATA_NAME, self.userdata_size)?
        } else {
            let mut noop = |_: u64, _: u64| true;
            let file = image::create_or_open(
                shared.platform.as_ref(),
                &userdata_path,
                0,
                u64::MAX,
                config.max_extents,
                &mut noop,
            )?;
            if file.size() != self.userdata_size {
                tracing::debug!(
                    "Reusing existing userdata of {} bytes (requested {})",
                    file.size(),
                    self.userdata_size
                );
            }
            self.userdata_size = file.size();
            file
        };
        self.add_image(USERDATA_NAME, userdata, self.userdata_size);
        let system = self.create_image(SYSTEM_NAME, self.gsi_size)?;
        self.add_image(SYSTEM_NAME, system, self.gsi_size);
        Ok(())
    }

    fn add_image(&mut self, name: &'static str, file: SplitImage, actual_size: u64) {
        self.images.insert(
            name,
            Image {
                file,
                actual_size,
                device: None,
            },
        );
    }

    fn image(&mut self, name: &str) -> Result<&mut Image> {
        self.images
            .get_mut(name)
            .ok_or_else(|| anyhow!("No image {name}"))
    }

    fn determine_write_method(&mut self) -> InstallResult<()> {
        let bdev = self.image(SYSTEM_NAME)?.file.bdev().clone();
        self.use_dm = bdev.is_devicemapper;
        if self.use_dm && self.external {
            return Err(anyhow!(
                "Cannot write through device-mapper on removable storage ({})",
                bdev.path
            )
            .into());
        }
        tracing::debug!("Write method for {}: dm={}", bdev.path, self.use_dm);
        Ok(())
    }

    /// Describe the images from their current extents.
    #[context("Building partition metadata")]
    fn build_metadata(&self) -> Result<PartitionMetadata> {
        let platform = self.shared.platform.as_ref();
        let system = self
            .images
            .get(SYSTEM_NAME)
            .ok_or_else(|| anyhow!("No system image"))?;
        let bdev = system.file.bdev();
        let mut layouts = Vec::new();
        for (&name, img) in &self.images {
            if img.file.bdev() != bdev {
                anyhow::bail!("{name} is not on {}", bdev.path);
            }
            layouts.push(ImageLayout {
                name,
                size: img.actual_size,
                extents: img.file.extents(),
                readonly: name == SYSTEM_NAME,
            });
        }
        let size = platform.block_device_size(&bdev.path)?;
        metadata::build(metadata::block_device_info(&bdev.path, size), &layouts)
    }

    /// Route writes to `name` through a device-mapper node if needed.
    #[context("Opening partition {name}")]
    fn open_partition(&mut self, name: &str) -> Result<()> {
        if !self.use_dm {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let table = self
            .metadata
            .as_ref()
            .ok_or_else(|| anyhow!("No partition metadata"))?
            .linear_table(name)?;
        let node = shared
            .platform
            .device_mapper()
            .create(name, &table, shared.config.dm_timeout())?;
        let device = BlockDeviceWriter::open(&node)?;
        self.image(name)?.device = Some(device);
        Ok(())
    }

    /// Zero the start of the userdata image.
    #[context("Zeroing userdata")]
    fn zero_userdata(&mut self, len: u64) -> Result<()> {
        self.open_partition(USERDATA_NAME)?;
        let image = self.image(USERDATA_NAME)?;
        let len = len.min(image.actual_size);
        let w = image.writer();
        w.write(&vec![0u8; len as usize])?;
        w.flush()?;
        image.device = None;
        self.unmap(USERDATA_NAME);
        Ok(())
    }

    fn system_writer(&mut self) -> Result<&mut dyn PartitionWriter> {
        Ok(self.image(SYSTEM_NAME)?.writer())
    }

    fn require_receiving(&self) -> InstallResult<()> {
        if self.state != InstallState::ReceivingPayload {
            return Err(InstallError::invalid("No install is in progress"));
        }
        Ok(())
    }

    fn check_remaining(&self, len: u64) -> InstallResult<()> {
        if self.bytes_written.saturating_add(len) > self.gsi_size {
            return Err(InstallError::invalid(format!(
                "Chunk of {len} bytes exceeds the image size ({} of {} bytes written)",
                self.bytes_written, self.gsi_size
            )));
        }
        Ok(())
    }

    /// Append `buf` to the system image.
    pub(crate) fn commit_chunk(&mut self, buf: &[u8]) -> InstallResult<()> {
        self.require_receiving()?;
        let len = buf.len() as u64;
        self.check_remaining(len)?;
        self.system_writer()?.write(buf)?;
        self.bytes_written += len;
        self.shared
            .progress
            .update(ProgressStatus::Working, self.bytes_written);
        Ok(())
    }

    /// Append exactly `len` bytes read from `src` to the system image.
    pub(crate) fn commit_stream(&mut self, src: &mut dyn Read, len: u64) -> InstallResult<()> {
        self.require_receiving()?;
        self.check_remaining(len)?;
        let block = self.system_writer()?.block_size().max(SECTOR_SIZE) as usize;
        let mut buf = vec![0u8; block];
        let mut remaining = len;
        while remaining > 0 {
            if self.shared.abort.load(Ordering::SeqCst) {
                return Err(InstallError::Cancelled);
            }
            let want = remaining.min(block as u64) as usize;
            let n = match src.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(InstallError::invalid(format!(
                        "Stream ended with {remaining} of {len} bytes remaining"
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(anyhow::Error::new(e).context("Reading stream").into()),
            };
            self.commit_chunk(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Make the installed image bootable. A failure after the image was
    /// found complete rolls back the whole install.
    pub(crate) fn finalize(&mut self, one_shot: bool) -> InstallResult<()> {
        self.require_receiving()?;
        if self.bytes_written != self.gsi_size {
            return Err(InstallError::invalid(format!(
                "Image is incomplete: {} of {} bytes written",
                self.bytes_written, self.gsi_size
            )));
        }
        match self.commit_boot_status(one_shot) {
            Ok(()) => {
                self.state = InstallState::Finalized;
                self.shared.progress.update(ProgressStatus::Complete, 0);
                tracing::info!("Install in {} is bootable", self.install_dir);
                Ok(())
            }
            Err(e) => {
                self.state = InstallState::Failed;
                if let Err(rm) = self.shared.store.remove_all() {
                    tracing::error!("{rm:#}");
                }
                self.rollback();
                Err(e.into())
            }
        }
    }

    #[context("Finalizing install")]
    fn commit_boot_status(&mut self, one_shot: bool) -> Result<()> {
        self.system_writer()?.flush()?;
        let platform = Arc::clone(&self.shared.platform);
        for (name, img) in &self.images {
            if !img.file.has_pinned_extents(platform.as_ref())? {
                anyhow::bail!("{name} no longer has pinned extents");
            }
        }
        let md = self
            .metadata
            .as_ref()
            .ok_or_else(|| anyhow!("No partition metadata"))?;
        self.shared
            .store
            .commit_install(&self.install_dir, md, one_shot)
    }

    /// Open an existing install using the partition sizes in its stored
    /// table. Extents are taken from the files as they are now.
    pub(crate) fn recover(shared: Arc<Shared>) -> InstallResult<Self> {
        let install_dir = shared
            .store
            .installed_image_dir(&shared.config.default_install_dir)?;
        let external = shared.platform.is_external_storage(&install_dir);
        let old = shared.store.read_metadata()?;
        let mut s = Self::new(shared, install_dir, external);
        s.state = InstallState::Finalized;
        for name in [SYSTEM_NAME, USERDATA_NAME] {
            let size = old.partition_size(name);
            if size == 0 {
                return Err(anyhow!("Could not recover the size of {name}").into());
            }
            let mut noop = |_: u64, _: u64| true;
            let file = image::create_or_open(
                s.shared.platform.as_ref(),
                &s.image_path(name),
                0,
                u64::MAX,
                s.shared.config.max_extents,
                &mut noop,
            )?;
            if file.size() != size {
                return Err(anyhow!(
                    "{name} is {} bytes, but was installed as {size}",
                    file.size()
                )
                .into());
            }
            s.add_image(name, file, size);
        }
        s.gsi_size = old.partition_size(SYSTEM_NAME);
        s.userdata_size = old.partition_size(USERDATA_NAME);
        s.use_dm = s.image(SYSTEM_NAME)?.file.bdev().is_devicemapper && !s.external;
        s.metadata = Some(s.build_metadata()?);
        Ok(s)
    }

    /// Rewrite the table from current extents and enable booting.
    pub(crate) fn reenable(&mut self, one_shot: bool) -> InstallResult<()> {
        let md = self
            .metadata
            .as_ref()
            .ok_or_else(|| anyhow!("No partition metadata"))?;
        self.shared
            .store
            .reenable(Some(md), &InstallStatus::Attempts(0), one_shot)?;
        Ok(())
    }

    /// Zero the start of the installed userdata image.
    pub(crate) fn wipe_userdata(&mut self) -> InstallResult<()> {
        self.zero_userdata(USERDATA_WIPE_SIZE)?;
        Ok(())
    }

    /// True while chunks are being accepted.
    pub fn is_installing(&self) -> bool {
        self.state == InstallState::ReceivingPayload
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstallState {
        self.state
    }

    /// Size of the userdata image of this session.
    pub fn userdata_size(&self) -> u64 {
        self.userdata_size
    }

    /// The install directory of this session.
    pub fn install_dir(&self) -> &Utf8Path {
        &self.install_dir
    }

    fn unmap(&self, name: &str) {
        let dm = self.shared.platform.device_mapper();
        match dm.state(name) {
            Ok(DmDeviceState::Invalid) => {}
            Ok(_) => {
                if let Err(e) = dm.remove(name, self.shared.config.dm_timeout()) {
                    tracing::error!("{e:#}");
                }
            }
            Err(e) => tracing::warn!("Querying {name}: {e:#}"),
        }
    }

    /// Release all images and device-mapper nodes. Safe to call any
    /// number of times.
    pub(crate) fn cleanup(&mut self) {
        self.images.clear();
        for name in [USERDATA_NAME, SYSTEM_NAME] {
            self.unmap(name);
        }
        self.metadata = None;
    }

    /// Remove the image files this session created.
    fn remove_created(&mut self) {
        for name in std::mem::take(&mut self.created) {
            let path = self.image_path(name);
            if let Err(e) = SplitImage::remove_all(&path) {
                tracing::error!("{e:#}");
            }
        }
    }

    /// Undo an install: release everything and remove what was created.
    pub(crate) fn rollback(&mut self) {
        self.cleanup();
        self.remove_created();
        self.shared.progress.reset();
        if self.state == InstallState::ReceivingPayload {
            self.state = InstallState::Aborted;
        }
    }
}

impl Drop for InstallSession {
    fn drop(&mut self) {
        if self.state == InstallState::Finalized {
            self.cleanup();
        } else {
            self.rollback();
        }
    }
}
