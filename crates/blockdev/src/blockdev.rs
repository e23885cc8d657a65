//! Block device helpers: discovering which device backs a file,
//! sizing devices, and driving device-mapper.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

mod dm;
pub use dm::*;

/// The default location of sysfs.
const SYSFS: &str = "/sys";

/// The bottom-most block device holding a file, and whether any
/// device-mapper layer sits between it and the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingDevice {
    /// Path to the device node, e.g. `/dev/sda23`.
    pub path: Utf8PathBuf,
    /// True if the filesystem is mounted on a device-mapper node.
    pub is_devicemapper: bool,
}

impl BackingDevice {
    /// The kernel name of the device, e.g. `sda23`.
    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }
}

/// Parse the `KEY=value` lines of a sysfs `uevent` file.
fn parse_uevent(s: &str) -> HashMap<&str, &str> {
    s.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Parse a `major:minor` pair as found in sysfs `dev` files.
fn parse_majmin(s: &str) -> Result<(u32, u32)> {
    let (major, minor) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid device number: {s}"))?;
    Ok((
        major.parse().context("Parsing major")?,
        minor.parse().context("Parsing minor")?,
    ))
}

/// Walk down from the device `(major, minor)` through any device-mapper
/// layers, using the sysfs tree rooted at `sysfs`.
fn backing_device_in(sysfs: &Utf8Path, mut majmin: (u32, u32)) -> Result<BackingDevice> {
    let mut is_devicemapper = false;
    loop {
        let (major, minor) = majmin;
        let devdir = sysfs.join(format!("dev/block/{major}:{minor}"));
        let uevent = std::fs::read_to_string(devdir.join("uevent"))
            .with_context(|| format!("Reading {devdir}/uevent"))?;
        let uevent = parse_uevent(&uevent);
        let devname = uevent
            .get("DEVNAME")
            .ok_or_else(|| anyhow!("No DEVNAME for block device {major}:{minor}"))?;
        if !devdir.join("dm").try_exists()? {
            return Ok(BackingDevice {
                path: Utf8Path::new("/dev").join(devname),
                is_devicemapper,
            });
        }
        is_devicemapper = true;
        let slaves = devdir.join("slaves");
        let mut parents = std::fs::read_dir(&slaves)
            .with_context(|| format!("Reading {slaves}"))?
            .collect::<std::io::Result<Vec<_>>>()?;
        let parent = match parents.len() {
            1 => parents.remove(0),
            n => anyhow::bail!("{devname} has {n} parent devices, expected exactly one"),
        };
        let dev = std::fs::read_to_string(parent.path().join("dev"))
            .with_context(|| format!("Reading parent of {devname}"))?;
        tracing::trace!("{devname} is stacked on {}", dev.trim());
        majmin = parse_majmin(&dev)?;
    }
}

/// Find the block device holding the filesystem that contains `path`.
#[context("Finding block device for {path}")]
pub fn backing_device_for_path(path: &Utf8Path) -> Result<BackingDevice> {
    let st = rustix::fs::stat(path.as_std_path())?;
    let dev = st.st_dev;
    let majmin = (rustix::fs::major(dev), rustix::fs::minor(dev));
    let r = backing_device_in(Utf8Path::new(SYSFS), majmin)?;
    tracing::debug!("{path} is on {} (dm={})", r.path, r.is_devicemapper);
    Ok(r)
}

/// Return the size in bytes of a block device (or regular file).
#[context("Querying size of {path}")]
pub fn block_device_size(path: &Utf8Path) -> Result<u64> {
    let mut f = std::fs::File::open(path)?;
    Ok(f.seek(SeekFrom::End(0))?)
}

/// Parse a human-readable size into bytes; a bare number is bytes.
pub fn parse_size(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("KiB", 1u64 << 10),
        ("K", 1 << 10),
        ("MiB", 1 << 20),
        ("M", 1 << 20),
        ("GiB", 1 << 30),
        ("G", 1 << 30),
        ("TiB", 1 << 40),
        ("T", 1 << 40),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
            break;
        }
    }
    let v = s.trim().parse::<u64>()?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size overflows: {s}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        let ident_cases = [0, 10, 9, 1024].into_iter().map(|k| (k.to_string(), k));
        let cases = [
            ("0M", 0u64),
            ("4K", 4096),
            ("10M", 10 << 20),
            ("10MiB", 10 << 20),
            ("1G", 1 << 30),
            ("9GiB", 9 << 30),
            ("11T", 11 << 40),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v));
        for (s, v) in ident_cases.chain(cases) {
            assert_eq!(parse_size(&s).unwrap(), v as u64, "Parsing {s}");
        }
        assert!(parse_size("1Gx").is_err());
        assert!(parse_size("G").is_err());
    }

    #[test]
    fn test_parse_uevent() {
        let fixture = indoc::indoc! { r#"
        MAJOR=253
        MINOR=4
        DEVNAME=dm-4
        DEVTYPE=disk
        "# };
        let u = parse_uevent(fixture);
        assert_eq!(u["DEVNAME"], "dm-4");
        assert_eq!(u["MAJOR"], "253");
    }

    fn mkdev(sysfs: &Utf8Path, majmin: &str, name: &str) -> Utf8PathBuf {
        let d = sysfs.join("dev/block").join(majmin);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("uevent"), format!("DEVNAME={name}\n")).unwrap();
        d
    }

    #[test]
    fn test_backing_device_plain() -> Result<()> {
        let td = tempfile::tempdir()?;
        let sysfs = Utf8Path::from_path(td.path()).unwrap();
        mkdev(sysfs, "8:23", "sda23");
        let r = backing_device_in(sysfs, (8, 23))?;
        assert_eq!(
            r,
            BackingDevice {
                path: "/dev/sda23".into(),
                is_devicemapper: false
            }
        );
        assert_eq!(r.name(), "sda23");
        Ok(())
    }

    #[test]
    fn test_backing_device_stacked() -> Result<()> {
        let td = tempfile::tempdir()?;
        let sysfs = Utf8Path::from_path(td.path()).unwrap();
        mkdev(sysfs, "8:23", "sda23");
        // dm-5 -> dm-4 -> sda23
        for (majmin, name, parent) in [("253:5", "dm-5", "253:4"), ("253:4", "dm-4", "8:23")] {
            let d = mkdev(sysfs, majmin, name);
            std::fs::create_dir_all(d.join("dm"))?;
            let slave = d.join("slaves/parent");
            std::fs::create_dir_all(&slave)?;
            std::fs::write(slave.join("dev"), format!("{parent}\n"))?;
        }
        let r = backing_device_in(sysfs, (253, 5))?;
        assert_eq!(r.path, "/dev/sda23");
        assert!(r.is_devicemapper);
        Ok(())
    }

    #[test]
    fn test_backing_device_multiple_parents() -> Result<()> {
        let td = tempfile::tempdir()?;
        let sysfs = Utf8Path::from_path(td.path()).unwrap();
        let d = mkdev(sysfs, "253:0", "dm-0");
        std::fs::create_dir_all(d.join("dm"))?;
        std::fs::create_dir_all(d.join("slaves/a"))?;
        std::fs::create_dir_all(d.join("slaves/b"))?;
        assert!(backing_device_in(sysfs, (253, 0)).is_err());
        Ok(())
    }

    #[test]
    fn test_block_device_size_of_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let p = Utf8Path::from_path(td.path()).unwrap().join("disk");
        std::fs::File::create(&p)?.set_len(1 << 20)?;
        assert_eq!(block_device_size(&p)?, 1 << 20);
        Ok(())
    }
}
