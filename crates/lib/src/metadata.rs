//! # Partition metadata
//!
//! Installed images are described to first-stage boot as logical
//! partitions: a table naming each partition and listing the physical
//! sector ranges that make it up. The table is exported as JSON and is
//! the only record of each partition's logical size that survives a
//! reboot.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use gsid_blockdev::DmTable;
use serde::{Deserialize, Serialize};

use crate::fiemap::Extent;

/// All sizes and offsets in the table are in units of this.
pub const SECTOR_SIZE: u64 = 512;

/// Version of the exported format.
const METADATA_VERSION: u32 = 1;

/// The group holding installed images.
pub const GSI_GROUP: &str = "gsi";

/// A block device partitions are carved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDeviceInfo {
    /// Kernel name, e.g. `sda23`.
    pub name: String,
    /// Device node.
    pub path: Utf8PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// A named set of partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionGroup {
    /// Group name.
    pub name: String,
    /// Combined size limit of the group's partitions; 0 is unlimited.
    pub maximum_size: u64,
}

/// Where the sectors of an extent come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExtentTarget {
    /// A range of a block device.
    #[serde(rename_all = "kebab-case")]
    Linear {
        /// Index into [`PartitionMetadata::block_devices`].
        block_device_index: u32,
        /// First sector on that device.
        physical_sector: u64,
    },
    /// Reads as zeroes.
    Zero,
}

/// A contiguous run of sectors of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionExtent {
    /// Length in sectors.
    pub num_sectors: u64,
    /// Backing storage.
    #[serde(flatten)]
    pub target: ExtentTarget,
}

/// A logical partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Partition {
    /// Partition name, e.g. `system_gsi`.
    pub name: String,
    /// Owning group.
    pub group: String,
    /// Whether the partition is mapped read-only.
    pub readonly: bool,
    /// The extents, in logical order.
    pub extents: Vec<PartitionExtent>,
}

/// An exported partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionMetadata {
    /// Format version.
    pub version: u32,
    /// Devices referenced by linear extents.
    pub block_devices: Vec<BlockDeviceInfo>,
    /// Partition groups.
    pub groups: Vec<PartitionGroup>,
    /// Partitions.
    pub partitions: Vec<Partition>,
}

impl PartitionMetadata {
    /// Look up a partition by name.
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// The size in bytes of partition `name`. Returns 0 if there is no
    /// such partition, or if it has an extent that is not a linear
    /// mapping.
    pub fn partition_size(&self, name: &str) -> u64 {
        let Some(p) = self.partition(name) else {
            return 0;
        };
        let mut sectors = 0u64;
        for e in &p.extents {
            match e.target {
                ExtentTarget::Linear { .. } => sectors += e.num_sectors,
                ExtentTarget::Zero => {
                    tracing::error!("{name}: unsupported extent type");
                    return 0;
                }
            }
        }
        sectors * SECTOR_SIZE
    }

    /// The device-mapper table that maps partition `name`.
    pub fn linear_table(&self, name: &str) -> Result<DmTable> {
        let p = self
            .partition(name)
            .ok_or_else(|| anyhow!("No partition {name}"))?;
        let mut table = DmTable::default();
        for e in &p.extents {
            let ExtentTarget::Linear {
                block_device_index,
                physical_sector,
            } = e.target
            else {
                anyhow::bail!("{name}: cannot map non-linear extent");
            };
            let dev = self
                .block_devices
                .get(block_device_index as usize)
                .ok_or_else(|| anyhow!("{name}: invalid block device {block_device_index}"))?;
            table.push_linear(e.num_sectors, &dev.path, physical_sector);
        }
        Ok(table)
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse stored metadata.
    pub fn from_json(s: &str) -> Result<Self> {
        let r: Self = serde_json::from_str(s).context("Parsing partition metadata")?;
        if r.version != METADATA_VERSION {
            anyhow::bail!("Unsupported metadata version {}", r.version);
        }
        Ok(r)
    }
}

/// Incrementally builds a [`PartitionMetadata`] over one block device.
#[derive(Debug)]
pub struct MetadataBuilder {
    device: BlockDeviceInfo,
    groups: Vec<PartitionGroup>,
    partitions: Vec<Partition>,
}

impl MetadataBuilder {
    /// Start a table for partitions on `device`.
    pub fn new(device: BlockDeviceInfo) -> Self {
        Self {
            device,
            groups: Vec::new(),
            partitions: Vec::new(),
        }
    }

    /// Add a partition group.
    pub fn add_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        if self.groups.iter().any(|g| g.name == name) {
            anyhow::bail!("Duplicate group {name}");
        }
        self.groups.push(PartitionGroup {
            name: name.to_owned(),
            maximum_size,
        });
        Ok(())
    }

    /// Add an empty partition to `group`.
    pub fn add_partition(&mut self, name: &str, group: &str, readonly: bool) -> Result<()> {
        if !self.groups.iter().any(|g| g.name == group) {
            anyhow::bail!("No such group {group}");
        }
        if self.partitions.iter().any(|p| p.name == name) {
            anyhow::bail!("Duplicate partition {name}");
        }
        self.partitions.push(Partition {
            name: name.to_owned(),
            group: group.to_owned(),
            readonly,
            extents: Vec::new(),
        });
        Ok(())
    }

    /// Append `num_sectors` starting at `physical_sector` of the block
    /// device to partition `name`.
    pub fn add_linear_extent(
        &mut self,
        name: &str,
        num_sectors: u64,
        physical_sector: u64,
    ) -> Result<()> {
        let end = physical_sector
            .checked_add(num_sectors)
            .and_then(|end| end.checked_mul(SECTOR_SIZE))
            .ok_or_else(|| anyhow!("{name}: extent overflows"))?;
        if end > self.device.size {
            anyhow::bail!(
                "{name}: extent {physical_sector}+{num_sectors} is beyond the end of {}",
                self.device.path
            );
        }
        let group = self
            .partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.group.clone())
            .ok_or_else(|| anyhow!("No such partition {name}"))?;
        let limit = self
            .groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.maximum_size)
            .unwrap_or_default();
        if limit > 0 {
            let used: u64 = self
                .partitions
                .iter()
                .filter(|p| p.group == group)
                .flat_map(|p| &p.extents)
                .map(|e| e.num_sectors)
                .sum();
            if (used + num_sectors) * SECTOR_SIZE > limit {
                anyhow::bail!("{name}: group {group} is full");
            }
        }
        // Checked above
        let Some(p) = self.partitions.iter_mut().find(|p| p.name == name) else {
            anyhow::bail!("No such partition {name}");
        };
        p.extents.push(PartitionExtent {
            num_sectors,
            target: ExtentTarget::Linear {
                block_device_index: 0,
                physical_sector,
            },
        });
        Ok(())
    }

    /// Finish the table.
    pub fn export(self) -> PartitionMetadata {
        PartitionMetadata {
            version: METADATA_VERSION,
            block_devices: vec![self.device],
            groups: self.groups,
            partitions: self.partitions,
        }
    }
}

/// The layout of one image to describe.
#[derive(Debug)]
pub struct ImageLayout<'a> {
    /// Partition name.
    pub name: &'a str,
    /// Logical size of the partition.
    pub size: u64,
    /// Physical extents in logical order, in bytes.
    pub extents: &'a [Extent],
    /// Map read-only.
    pub readonly: bool,
}

fn sectors(v: u64, what: &str, name: &str) -> Result<u64> {
    if v % SECTOR_SIZE != 0 {
        anyhow::bail!("{name}: {what} {v} is not sector-aligned");
    }
    Ok(v / SECTOR_SIZE)
}

/// Build a table describing `images`, all of which live on `device`.
/// The extents of each image must cover exactly its size.
pub fn build(device: BlockDeviceInfo, images: &[ImageLayout]) -> Result<PartitionMetadata> {
    let mut b = MetadataBuilder::new(device);
    b.add_group(GSI_GROUP, 0)?;
    for img in images {
        let name = img.name;
        b.add_partition(name, GSI_GROUP, img.readonly)?;
        let mut covered = 0u64;
        for e in img.extents {
            if e.logical != covered {
                anyhow::bail!("{name}: extents are not contiguous at offset {covered}");
            }
            let num_sectors = sectors(e.length, "extent length", name)?;
            let physical_sector = sectors(e.physical, "extent offset", name)?;
            b.add_linear_extent(name, num_sectors, physical_sector)?;
            covered += e.length;
        }
        if covered != img.size {
            anyhow::bail!("{name}: extents cover {covered} bytes, expected {}", img.size);
        }
    }
    Ok(b.export())
}

/// Describe the block device at `path` for a table.
pub fn block_device_info(path: &Utf8Path, size: u64) -> BlockDeviceInfo {
    BlockDeviceInfo {
        name: path.file_name().unwrap_or(path.as_str()).to_owned(),
        path: path.to_owned(),
        size,
    }
}
