//! Sequential writers for partition contents.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// Block size used when the backend has no better answer.
pub(crate) const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Appends bytes to a partition, front to back.
pub trait PartitionWriter: Send + std::fmt::Debug {
    /// Write `buf` at the current position and advance it. Writing past
    /// the end of the partition is an error and writes nothing.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<()>;

    /// Capacity of the partition in bytes.
    fn size(&self) -> u64;

    /// Preferred I/O size.
    fn block_size(&self) -> u64 {
        DEFAULT_BLOCK_SIZE
    }
}

/// Check that `len` more bytes fit after `pos` in a partition of `size` bytes.
pub(crate) fn check_bounds(pos: u64, len: usize, size: u64) -> Result<()> {
    let end = pos
        .checked_add(len as u64)
        .context("Write offset overflows")?;
    if end > size {
        anyhow::bail!("Write of {len} bytes at offset {pos} exceeds partition size {size}");
    }
    Ok(())
}

/// Writes to a block device, typically a device-mapper node mapping
/// the extents of an image file.
#[derive(Debug)]
pub struct BlockDeviceWriter {
    path: Utf8PathBuf,
    file: File,
    size: u64,
    pos: u64,
}

impl BlockDeviceWriter {
    /// Open `path` for writing.
    #[context("Opening {path} for writing")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;
        let size = file.seek(SeekFrom::End(0))?;
        tracing::debug!("Opened {path}: {size} bytes");
        Ok(Self {
            path: path.to_owned(),
            file,
            size,
            pos: 0,
        })
    }

    /// The device node being written.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl PartitionWriter for BlockDeviceWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_bounds(self.pos, buf.len(), self.size)?;
        self.file
            .write_all_at(buf, self.pos)
            .with_context(|| format!("Writing to {}", self.path))?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .with_context(|| format!("Syncing {}", self.path))
    }

    fn size(&self) -> u64 {
        self.size
    }
}
