//! # Preallocated image files
//!
//! An image is stored as one or more fully allocated "pieces", so that
//! it fits on filesystems with a small maximum file size (vfat).  The
//! file at the image path itself is a small index listing the pieces:
//!
//! ```text
//! system_gsi.img          index: "system_gsi.img.0000\nsystem_gsi.img.0001\n"
//! system_gsi.img.0000     piece
//! system_gsi.img.0001     piece
//! ```
//!
//! After allocation the physical extents of every piece are recorded.
//! They are what the partition table describes, so they must not move
//! before the image is booted; see [`SplitImage::has_pinned_extents`].

use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use gsid_blockdev::BackingDevice;
use rustix::fs::FallocateFlags;
use thiserror::Error;

use crate::error::InstallError;
use crate::fiemap::Extent;
use crate::platform::Platform;
use crate::writer::{check_bounds, PartitionWriter, DEFAULT_BLOCK_SIZE};

/// Space is allocated in steps of this size, between which the
/// progress callback runs.
const ALLOCATION_CHUNK: u64 = 64 << 20;

/// Allocation progress callback: `(bytes_done, bytes_total)`; returning
/// `false` cancels the allocation.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(u64, u64) -> bool;

/// Failure to create or open an image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The allocation is made of too many extents to describe.
    #[error("{path} has {count} extents, more than the maximum of {max}")]
    TooFragmented {
        /// The image.
        path: Utf8PathBuf,
        /// Extents found.
        count: usize,
        /// Extents allowed.
        max: u64,
    },
    /// The progress callback asked to stop.
    #[error("Allocation of {0} cancelled")]
    Cancelled(Utf8PathBuf),
    /// Anything else.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<ImageError> for InstallError {
    fn from(e: ImageError) -> Self {
        match e {
            e @ ImageError::TooFragmented { .. } => {
                InstallError::FileSystemCluttered(e.to_string())
            }
            ImageError::Cancelled(_) => InstallError::Cancelled,
            ImageError::Io(e) => InstallError::Internal(e),
        }
    }
}

#[derive(Debug)]
struct Piece {
    path: Utf8PathBuf,
    file: File,
    size: u64,
}

/// A preallocated image, possibly split across several files.
#[derive(Debug)]
pub struct SplitImage {
    path: Utf8PathBuf,
    pieces: Vec<Piece>,
    size: u64,
    extents: Vec<Extent>,
    bdev: BackingDevice,
    block_size: u64,
    pos: u64,
}

fn piece_name(index_name: &str, n: usize) -> String {
    format!("{index_name}.{n:04}")
}

fn is_piece_of(index_name: &str, name: &str) -> bool {
    name.strip_prefix(index_name)
        .and_then(|s| s.strip_prefix('.'))
        .is_some_and(|s| s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()))
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str)> {
    let parent = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Invalid image path {path}"))?;
    Ok((parent, name))
}

fn open_parent(path: &Utf8Path) -> Result<(cap_std::fs::Dir, &str)> {
    let (parent, name) = split_path(path)?;
    let dir = cap_std::fs::Dir::open_ambient_dir(parent, cap_std::ambient_authority())
        .with_context(|| format!("Opening {parent}"))?;
    Ok((dir, name))
}

/// Read the piece list of the image at `path`; `None` if it does not exist.
fn read_index(path: &Utf8Path) -> Result<Option<Vec<Utf8PathBuf>>> {
    let (parent, _) = split_path(path)?;
    let buf = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    let pieces = buf
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            if l.contains('/') {
                anyhow::bail!("Invalid piece name in {path}: {l}");
            }
            Ok(parent.join(l))
        })
        .collect::<Result<Vec<_>>>()?;
    if pieces.is_empty() {
        anyhow::bail!("{path} lists no pieces");
    }
    Ok(Some(pieces))
}

/// Allocate `len` bytes of `file` in bounded steps. `done` and `total`
/// are relative to the whole image.
fn allocate(
    file: &File,
    len: u64,
    done: &mut u64,
    total: u64,
    progress: &mut dyn FnMut(u64, u64) -> bool,
) -> Result<bool> {
    let mut offset = 0;
    while offset < len {
        let n = ALLOCATION_CHUNK.min(len - offset);
        rustix::fs::fallocate(file, FallocateFlags::empty(), offset, n)
            .with_context(|| format!("Allocating {n} bytes at {offset}"))?;
        offset += n;
        *done += n;
        if !progress(*done, total) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Query the extents of each piece and lay them out end to end. Extents
/// are clipped to the piece size, since the filesystem allocates whole
/// blocks.
fn collect_extents(platform: &dyn Platform, pieces: &[Piece]) -> Result<Vec<Extent>> {
    let mut r = Vec::new();
    let mut base = 0u64;
    for piece in pieces {
        for e in platform.file_extents(&piece.path, &piece.file)? {
            if e.logical >= piece.size {
                continue;
            }
            let length = e.length.min(piece.size - e.logical);
            r.push(Extent {
                logical: base + e.logical,
                physical: e.physical,
                length,
            });
        }
        base += piece.size;
    }
    Ok(r)
}

impl SplitImage {
    /// Allocate a new image of `size` bytes at `path`, in pieces of at
    /// most `max_piece_size` bytes. Any file created is removed again if
    /// allocation fails or is cancelled.
    pub fn create(
        platform: &dyn Platform,
        path: &Utf8Path,
        size: u64,
        max_piece_size: u64,
        progress: ProgressCallback,
    ) -> Result<Self, ImageError> {
        match Self::create_inner(platform, path, size, max_piece_size, progress) {
            Ok(Some(img)) => Ok(img),
            Ok(None) => {
                Self::remove_all(path)?;
                Err(ImageError::Cancelled(path.to_owned()))
            }
            Err(e) => {
                if let Err(rm) = Self::remove_all(path) {
                    tracing::warn!("Cleaning up {path}: {rm:#}");
                }
                Err(e.into())
            }
        }
    }

    #[context("Creating image {path}")]
    fn create_inner(
        platform: &dyn Platform,
        path: &Utf8Path,
        size: u64,
        max_piece_size: u64,
        progress: ProgressCallback,
    ) -> Result<Option<Self>> {
        if size == 0 {
            anyhow::bail!("Cannot create an empty image");
        }
        if max_piece_size == 0 {
            anyhow::bail!("Invalid maximum piece size");
        }
        let (dir, index_name) = open_parent(path)?;
        if dir.try_exists(index_name)? {
            anyhow::bail!("{path} already exists");
        }
        let (parent, _) = split_path(path)?;
        let mut pieces = Vec::new();
        let mut done = 0u64;
        let mut remaining = size;
        while remaining > 0 {
            let piece_size = remaining.min(max_piece_size);
            let piece_path = parent.join(piece_name(index_name, pieces.len()));
            let file = File::options()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&piece_path)
                .with_context(|| format!("Creating {piece_path}"))?;
            let complete = allocate(&file, piece_size, &mut done, size, progress)
                .with_context(|| format!("Allocating {piece_path}"))?;
            file.sync_all()?;
            pieces.push(Piece {
                path: piece_path,
                file,
                size: piece_size,
            });
            if !complete {
                tracing::info!("Allocation of {path} cancelled at {done} bytes");
                return Ok(None);
            }
            remaining -= piece_size;
        }
        let mut index = String::new();
        for n in 0..pieces.len() {
            index.push_str(&piece_name(index_name, n));
            index.push('\n');
        }
        dir.atomic_write(index_name, index)
            .with_context(|| format!("Writing {path}"))?;
        tracing::debug!("Allocated {path}: {size} bytes in {} pieces", pieces.len());
        Self::from_pieces(platform, path, pieces).map(Some)
    }

    /// Open an existing image without changing its size.
    #[context("Opening image {path}")]
    pub fn open(platform: &dyn Platform, path: &Utf8Path) -> Result<Self> {
        let names = read_index(path)?.with_context(|| format!("{path} does not exist"))?;
        let pieces = names
            .into_iter()
            .map(|piece_path| {
                let file = File::options()
                    .read(true)
                    .write(true)
                    .open(&piece_path)
                    .with_context(|| format!("Opening {piece_path}"))?;
                let size = file.metadata()?.len();
                Ok(Piece {
                    path: piece_path,
                    file,
                    size,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_pieces(platform, path, pieces)
    }

    fn from_pieces(platform: &dyn Platform, path: &Utf8Path, pieces: Vec<Piece>) -> Result<Self> {
        let size = pieces.iter().map(|p| p.size).sum();
        let extents = collect_extents(platform, &pieces)?;
        let bdev = platform.backing_device(path)?;
        let block_size = match pieces.first() {
            Some(p) => p.file.metadata()?.blksize(),
            None => DEFAULT_BLOCK_SIZE,
        };
        Ok(Self {
            path: path.to_owned(),
            pieces,
            size,
            extents,
            bdev,
            block_size,
            pos: 0,
        })
    }

    /// Remove the index and every piece of the image at `path`. Missing
    /// files are not an error, including pieces left behind by an
    /// allocation that never wrote its index.
    #[context("Removing image {path}")]
    pub fn remove_all(path: &Utf8Path) -> Result<()> {
        let (parent, index_name) = split_path(path)?;
        let dir = match cap_std::fs::Dir::open_ambient_dir(parent, cap_std::ambient_authority()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Opening {parent}")),
        };
        let mut removed = 0;
        for entry in dir.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_piece_of(index_name, name) && dir.remove_file_optional(name)? {
                removed += 1;
            }
        }
        if dir.remove_file_optional(index_name)? {
            tracing::debug!("Removed {path} and {removed} pieces");
        }
        Ok(())
    }

    /// True if an image index exists at `path`.
    pub fn exists(path: &Utf8Path) -> Result<bool> {
        Ok(path.try_exists()?)
    }

    /// Total size of the pieces of the image at `path`, without
    /// querying extents.
    #[context("Querying size of {path}")]
    pub fn allocated_size(path: &Utf8Path) -> Result<u64> {
        let names = read_index(path)?.with_context(|| format!("{path} does not exist"))?;
        names.iter().try_fold(0u64, |acc, p| {
            let len = std::fs::metadata(p)
                .with_context(|| format!("Querying {p}"))?
                .len();
            Ok(acc + len)
        })
    }

    /// The index path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Physical extents recorded when the image was allocated or opened.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// The block device holding the image.
    pub fn bdev(&self) -> &BackingDevice {
        &self.bdev
    }

    /// True if the extents of every piece are where they were when
    /// recorded.
    pub fn has_pinned_extents(&self, platform: &dyn Platform) -> Result<bool> {
        let current = collect_extents(platform, &self.pieces)
            .with_context(|| format!("Verifying extents of {}", self.path))?;
        if current != self.extents {
            tracing::warn!("{}: extents have moved", self.path);
            return Ok(false);
        }
        Ok(true)
    }
}

impl PartitionWriter for SplitImage {
    fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        check_bounds(self.pos, buf.len(), self.size)?;
        let mut start = 0u64;
        for piece in &self.pieces {
            if buf.is_empty() {
                break;
            }
            let end = start + piece.size;
            if self.pos < end {
                let n = (end - self.pos).min(buf.len() as u64) as usize;
                piece
                    .file
                    .write_all_at(&buf[..n], self.pos - start)
                    .with_context(|| format!("Writing {}", piece.path))?;
                self.pos += n as u64;
                buf = &buf[n..];
            }
            start = end;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for piece in &self.pieces {
            piece
                .file
                .sync_data()
                .with_context(|| format!("Syncing {}", piece.path))?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

/// Create an image of `size` bytes at `path`, or open the existing one
/// if `size` is 0. Either way the image must have at most `max_extents`
/// extents.
pub fn create_or_open(
    platform: &dyn Platform,
    path: &Utf8Path,
    size: u64,
    max_piece_size: u64,
    max_extents: u64,
    progress: ProgressCallback,
) -> Result<SplitImage, ImageError> {
    let img = if size == 0 {
        SplitImage::open(platform, path)?
    } else {
        SplitImage::create(platform, path, size, max_piece_size, progress)?
    };
    let count = img.extents().len();
    if count as u64 > max_extents {
        if size != 0 {
            drop(img);
            SplitImage::remove_all(path)?;
        }
        return Err(ImageError::TooFragmented {
            path: path.to_owned(),
            count,
            max: max_extents,
        });
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePlatform;

    fn no_progress() -> impl FnMut(u64, u64) -> bool {
        |_, _| true
    }

    #[test]
    fn test_piece_names() {
        assert_eq!(piece_name("system_gsi.img", 3), "system_gsi.img.0003");
        assert!(is_piece_of("system_gsi.img", "system_gsi.img.0000"));
        assert!(!is_piece_of("system_gsi.img", "system_gsi.img"));
        assert!(!is_piece_of("system_gsi.img", "system_gsi.img.tmp"));
        assert!(!is_piece_of("system_gsi.img", "userdata_gsi.img.0000"));
    }

    #[test]
    fn test_create_split() -> Result<()> {
        let p = FakePlatform::new()?;
        let path = p.dir().join("system_gsi.img");
        let mut img = SplitImage::create(&p, &path, 10 << 20, 4 << 20, &mut no_progress())?;
        assert_eq!(img.size(), 10 << 20);
        assert_eq!(
            std::fs::read_to_string(&path)?,
            "system_gsi.img.0000\nsystem_gsi.img.0001\nsystem_gsi.img.0002\n"
        );
        assert_eq!(SplitImage::allocated_size(&path)?, 10 << 20);
        let total: u64 = img.extents().iter().map(|e| e.length).sum();
        assert_eq!(total, 10 << 20);

        // A write straddling two pieces.
        let buf = vec![0xaau8; 5 << 20];
        img.write(&buf)?;
        img.flush()?;
        let second = std::fs::read(p.dir().join("system_gsi.img.0001"))?;
        assert!(second[..1 << 20].iter().all(|&b| b == 0xaa));
        assert!(second[1 << 20..].iter().all(|&b| b == 0));
        assert!(img.has_pinned_extents(&p)?);
        drop(img);

        let img = SplitImage::open(&p, &path)?;
        assert_eq!(img.size(), 10 << 20);
        drop(img);

        SplitImage::remove_all(&path)?;
        assert!(!SplitImage::exists(&path)?);
        assert_eq!(std::fs::read_dir(p.dir())?.count(), 0);
        // Idempotent
        SplitImage::remove_all(&path)?;
        Ok(())
    }

    #[test]
    fn test_create_exists() -> Result<()> {
        let p = FakePlatform::new()?;
        let path = p.dir().join("a.img");
        let _img = SplitImage::create(&p, &path, 1 << 20, u64::MAX, &mut no_progress())?;
        assert!(SplitImage::create(&p, &path, 1 << 20, u64::MAX, &mut no_progress()).is_err());
        Ok(())
    }

    #[test]
    fn test_cancel() -> Result<()> {
        let p = FakePlatform::new()?;
        let path = p.dir().join("a.img");
        let mut calls = 0;
        let mut cb = |done: u64, total: u64| {
            assert!(done <= total);
            calls += 1;
            calls < 2
        };
        let r = SplitImage::create(&p, &path, 200 << 20, u64::MAX, &mut cb);
        assert!(matches!(r, Err(ImageError::Cancelled(_))));
        assert_eq!(calls, 2);
        assert_eq!(std::fs::read_dir(p.dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_remove_orphan_pieces() -> Result<()> {
        let p = FakePlatform::new()?;
        std::fs::write(p.dir().join("a.img.0000"), b"")?;
        std::fs::write(p.dir().join("a.img.0001"), b"")?;
        std::fs::write(p.dir().join("b.img.0000"), b"")?;
        SplitImage::remove_all(&p.dir().join("a.img"))?;
        let names: Vec<_> = std::fs::read_dir(p.dir())?
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["b.img.0000"]);
        Ok(())
    }

    #[test]
    fn test_too_fragmented() -> Result<()> {
        let p = FakePlatform::new()?;
        p.set_extent_size(4096);
        let path = p.dir().join("a.img");
        let r = create_or_open(&p, &path, 1 << 20, u64::MAX, 16, &mut no_progress());
        match r {
            Err(ImageError::TooFragmented { count, max, .. }) => {
                assert_eq!(count, 256);
                assert_eq!(max, 16);
            }
            o => panic!("Unexpected {o:?}"),
        }
        assert!(!SplitImage::exists(&path)?);
        let e: InstallError = ImageError::Cancelled(path).into();
        assert!(matches!(e, InstallError::Cancelled));
        Ok(())
    }

    #[test]
    fn test_relocated() -> Result<()> {
        let p = FakePlatform::new()?;
        let path = p.dir().join("a.img");
        let img = create_or_open(&p, &path, 1 << 20, u64::MAX, 512, &mut no_progress())?;
        assert!(img.has_pinned_extents(&p)?);
        p.set_relocated(true);
        assert!(!img.has_pinned_extents(&p)?);
        Ok(())
    }

    #[test]
    fn test_open_missing() -> Result<()> {
        let p = FakePlatform::new()?;
        let path = p.dir().join("a.img");
        assert!(create_or_open(&p, &path, 0, u64::MAX, 512, &mut no_progress()).is_err());
        assert!(SplitImage::allocated_size(&path).is_err());
        Ok(())
    }
}
