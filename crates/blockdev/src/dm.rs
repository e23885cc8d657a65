//! Minimal device-mapper control built on `dmsetup`.

use std::fmt::Display;
use std::io::Write;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use gsid_utils::CommandRunExt;

/// Where device-mapper nodes appear.
const DEV_MAPPER: &str = "/dev/mapper";
/// How often to poll for device nodes.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The state of a named device-mapper device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmDeviceState {
    /// No such device.
    Invalid,
    /// The device exists but I/O to it is suspended.
    Suspended,
    /// The device exists with a live table.
    Active,
}

/// One `linear` target line of a device-mapper table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearTarget {
    /// First logical sector covered by this target.
    pub start_sector: u64,
    /// Length in sectors.
    pub num_sectors: u64,
    /// The device being mapped.
    pub device: Utf8PathBuf,
    /// Offset in sectors into `device`.
    pub physical_sector: u64,
}

/// A device-mapper table made only of linear targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmTable {
    targets: Vec<LinearTarget>,
}

impl DmTable {
    /// Append a linear target directly after the previous one.
    pub fn push_linear(&mut self, num_sectors: u64, device: &Utf8Path, physical_sector: u64) {
        let start_sector = self.num_sectors();
        self.targets.push(LinearTarget {
            start_sector,
            num_sectors,
            device: device.to_owned(),
            physical_sector,
        });
    }

    /// Total length of the table in sectors.
    pub fn num_sectors(&self) -> u64 {
        self.targets.iter().map(|t| t.num_sectors).sum()
    }

    /// The targets, in logical order.
    pub fn targets(&self) -> &[LinearTarget] {
        &self.targets
    }
}

impl Display for DmTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for t in &self.targets {
            writeln!(
                f,
                "{} {} linear {} {}",
                t.start_sector, t.num_sectors, t.device, t.physical_sector
            )?;
        }
        Ok(())
    }
}

/// Operations on named device-mapper devices.
pub trait DeviceMapper: Send + Sync + std::fmt::Debug {
    /// Create (and activate) `name` with `table`, returning the path of
    /// the device node once it exists.
    fn create(&self, name: &str, table: &DmTable, timeout: Duration) -> Result<Utf8PathBuf>;

    /// Remove `name`, waiting until its device node is gone.
    fn remove(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Query the state of `name`.
    fn state(&self, name: &str) -> Result<DmDeviceState>;
}

/// The production [`DeviceMapper`], driving the `dmsetup` binary.
#[derive(Debug, Default)]
pub struct Dmsetup;

fn wait_for_path(path: &Utf8Path, present: bool, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while path.try_exists()? != present {
        if start.elapsed() > timeout {
            let what = if present { "appear" } else { "disappear" };
            anyhow::bail!("Timed out waiting for {path} to {what}");
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// Interpret the `attr` column of `dmsetup info -c`.
fn parse_dm_attr(attr: &str) -> DmDeviceState {
    match attr.trim().chars().nth(1) {
        Some('s') => DmDeviceState::Suspended,
        _ => DmDeviceState::Active,
    }
}

impl DeviceMapper for Dmsetup {
    #[context("Creating device-mapper device {name}")]
    fn create(&self, name: &str, table: &DmTable, timeout: Duration) -> Result<Utf8PathBuf> {
        let mut tablefile = tempfile::NamedTempFile::new()?;
        tablefile.write_all(table.to_string().as_bytes())?;
        tablefile.flush()?;
        Command::new("dmsetup")
            .args(["create", name])
            .arg(tablefile.path())
            .log_debug()
            .run_capture_stderr()?;
        let path = Utf8Path::new(DEV_MAPPER).join(name);
        wait_for_path(&path, true, timeout)?;
        tracing::debug!("Created {path} ({} sectors)", table.num_sectors());
        Ok(path)
    }

    #[context("Removing device-mapper device {name}")]
    fn remove(&self, name: &str, timeout: Duration) -> Result<()> {
        Command::new("dmsetup")
            .args(["remove", "--retry", name])
            .log_debug()
            .run_capture_stderr()?;
        wait_for_path(&Utf8Path::new(DEV_MAPPER).join(name), false, timeout)
    }

    fn state(&self, name: &str) -> Result<DmDeviceState> {
        let o = Command::new("dmsetup")
            .args(["info", "-c", "--noheadings", "-o", "attr", name])
            .output()
            .context("Spawning dmsetup info")?;
        if !o.status.success() {
            let stderr = String::from_utf8_lossy(&o.stderr);
            if stderr.contains("does not exist") || stderr.contains("No such device") {
                return Ok(DmDeviceState::Invalid);
            }
            anyhow::bail!("dmsetup info {name}: {}: {}", o.status, stderr.trim());
        }
        Ok(parse_dm_attr(&String::from_utf8_lossy(&o.stdout)))
    }
}
