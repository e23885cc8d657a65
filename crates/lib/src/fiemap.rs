//! Physical extent lookup via the `FS_IOC_FIEMAP` ioctl.

use std::os::fd::AsFd;

use anyhow::{Context, Result};
use rustix::ioctl::{opcode, Opcode, Updater};
use serde::{Deserialize, Serialize};

const FIEMAP_FLAG_SYNC: u32 = 0x0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0002;
const FIEMAP_EXTENT_DELALLOC: u32 = 0x0004;
const FIEMAP_EXTENT_ENCODED: u32 = 0x0008;
const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x0100;
const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0200;

/// Extents with any of these flags have no stable on-disk location.
const UNUSABLE_FLAGS: u32 = FIEMAP_EXTENT_UNKNOWN
    | FIEMAP_EXTENT_DELALLOC
    | FIEMAP_EXTENT_ENCODED
    | FIEMAP_EXTENT_NOT_ALIGNED
    | FIEMAP_EXTENT_DATA_INLINE;

/// Extents requested per ioctl call.
const BATCH: usize = 64;

/// One physically contiguous range of a file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Offset within the file.
    pub logical: u64,
    /// Offset on the block device.
    pub physical: u64,
    /// Length of the range.
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug)]
struct FiemapRequest {
    header: FiemapHeader,
    extents: [FiemapExtent; BATCH],
}

const FS_IOC_FIEMAP: Opcode = opcode::read_write::<FiemapHeader>(b'f', 11);

#[allow(unsafe_code)]
fn fiemap_batch(fd: impl AsFd, req: &mut FiemapRequest) -> rustix::io::Result<()> {
    // SAFETY: FiemapRequest is a `struct fiemap` followed by room for
    // exactly `fm_extent_count` extents, which is what the kernel expects.
    unsafe {
        let ctl = Updater::<FS_IOC_FIEMAP, FiemapRequest>::new(req);
        rustix::ioctl::ioctl(fd, ctl)
    }
}

/// Return the physical extents of `file`, syncing it first so that
/// delayed allocations are resolved.
pub fn file_extents(file: &std::fs::File) -> Result<Vec<Extent>> {
    let len = file.metadata()?.len();
    let mut r = Vec::new();
    let mut start = 0u64;
    while start < len {
        let mut req = FiemapRequest {
            header: FiemapHeader {
                fm_start: start,
                fm_length: len - start,
                fm_flags: FIEMAP_FLAG_SYNC,
                fm_extent_count: BATCH as u32,
                ..Default::default()
            },
            extents: [FiemapExtent::default(); BATCH],
        };
        fiemap_batch(file, &mut req).context("FS_IOC_FIEMAP")?;
        let mapped = req.header.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }
        let mut last = false;
        for fe in &req.extents[..mapped.min(BATCH)] {
            if fe.fe_flags & UNUSABLE_FLAGS != 0 {
                anyhow::bail!(
                    "Extent at offset {} has unusable flags {:#x}",
                    fe.fe_logical,
                    fe.fe_flags
                );
            }
            r.push(Extent {
                logical: fe.fe_logical,
                physical: fe.fe_physical,
                length: fe.fe_length,
            });
            start = fe.fe_logical + fe.fe_length;
            last = fe.fe_flags & FIEMAP_EXTENT_LAST != 0;
        }
        if last {
            break;
        }
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<FiemapHeader>(), 32);
        assert_eq!(std::mem::size_of::<FiemapExtent>(), 56);
        assert_eq!(
            std::mem::size_of::<FiemapRequest>(),
            32 + 56 * BATCH
        );
    }

    #[test]
    fn test_empty_file() -> Result<()> {
        let f = tempfile::tempfile()?;
        assert!(file_extents(&f)?.is_empty());
        Ok(())
    }
}
