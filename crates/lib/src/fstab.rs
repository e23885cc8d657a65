//! Just enough fstab parsing to find the verity mode of the system
//! partition.
//!
//! Both the classic six-column layout and the five-column layout whose
//! last column holds fs_mgr flags are understood.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

/// The fs_mgr flag that makes verification of the system partition
/// happen only once per boot, which a removable install cannot satisfy.
const CHECK_AT_MOST_ONCE: &str = "check_at_most_once";

/// One mount entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// The device or label.
    pub blk_device: String,
    /// Where it is mounted.
    pub mount_point: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Comma-separated mount options.
    pub mount_options: Vec<String>,
    /// Comma-separated fs_mgr flags; for six-column entries these are
    /// the mount options.
    pub fs_mgr_flags: Vec<String>,
}

/// A parsed fstab.
#[derive(Debug, Default)]
pub struct Fstab {
    entries: Vec<FstabEntry>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

impl Fstab {
    /// Parse fstab text.
    pub fn parse(s: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (n, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (mount_options, fs_mgr_flags) = match cols.as_slice() {
                [_, _, _, opts] => (split_list(opts), split_list(opts)),
                [_, _, _, opts, flags] => (split_list(opts), split_list(flags)),
                [_, _, _, opts, dump, pass]
                    if dump.parse::<u32>().is_ok() && pass.parse::<u32>().is_ok() =>
                {
                    (split_list(opts), split_list(opts))
                }
                _ => anyhow::bail!("Invalid fstab entry on line {}: {line}", n + 1),
            };
            entries.push(FstabEntry {
                blk_device: cols[0].to_owned(),
                mount_point: cols[1].to_owned(),
                fs_type: cols[2].to_owned(),
                mount_options,
                fs_mgr_flags,
            });
        }
        Ok(Self { entries })
    }

    /// Read and parse the fstab at `path`.
    #[context("Reading fstab {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    /// The first entry for `mount_point`.
    pub fn entry(&self, mount_point: &str) -> Option<&FstabEntry> {
        self.entries.iter().find(|e| e.mount_point == mount_point)
    }
}

/// Whether the system partition at `mount_point` in `fstab` is verified
/// with `check_at_most_once`. A missing fstab or entry is an error.
#[context("Checking verity mode of {mount_point}")]
pub fn uses_check_at_most_once(fstab: &Utf8Path, mount_point: &Utf8Path) -> Result<bool> {
    let fstab = Fstab::load(fstab)?;
    let entry = fstab
        .entry(mount_point.as_str())
        .with_context(|| format!("No fstab entry for {mount_point}"))?;
    Ok(entry.fs_mgr_flags.iter().any(|f| f == CHECK_AT_MOST_ONCE))
}
