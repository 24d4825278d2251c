//! Block device inspection using lsblk.
//!
//! Used on freshly attached loop devices to discover whether the image
//! carries a partition table and which partitions hold a filesystem.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::{CommandRunner, CommandSpec};

/// Filesystem types we are willing to hand to udisks.
pub const RECOGNIZED_FILESYSTEMS: &[&str] = &[
    "iso9660", "udf", "vfat", "squashfs", "erofs", "ext4", "ext3", "ext2", "exfat", "ntfs",
    "hfsplus", "btrfs", "xfs",
];

/// Returns true if `fstype` is a filesystem udisks can mount for us.
pub fn is_recognized_filesystem(fstype: &str) -> bool {
    RECOGNIZED_FILESYSTEMS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(fstype))
}

/// A block device and its children as reported by lsblk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Full device path (e.g. "/dev/loop0p1").
    pub path: PathBuf,
    /// lsblk device type ("loop", "part", ...).
    pub device_type: String,
    /// Filesystem type, if any.
    pub fstype: Option<String>,
    /// Partition table type ("dos", "gpt"), if any.
    pub pttype: Option<String>,
    /// Child devices in lsblk order.
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Returns child partitions in enumeration order, including nested ones.
    pub fn partitions(&self) -> Vec<&BlockDevice> {
        let mut parts = Vec::new();
        collect_partitions(&self.children, &mut parts);
        parts
    }

    /// Returns true if the device carries a partition table.
    pub fn has_partition_table(&self) -> bool {
        self.pttype.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Returns true if lsblk reports a filesystem we can mount.
    pub fn has_recognized_filesystem(&self) -> bool {
        self.fstype.as_deref().is_some_and(is_recognized_filesystem)
    }
}

fn collect_partitions<'a>(devices: &'a [BlockDevice], parts: &mut Vec<&'a BlockDevice>) {
    for dev in devices {
        if dev.device_type == "part" {
            parts.push(dev);
        }
        collect_partitions(&dev.children, parts);
    }
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    pttype: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

impl From<LsblkDevice> for BlockDevice {
    fn from(dev: LsblkDevice) -> Self {
        Self {
            path: PathBuf::from(dev.name),
            device_type: dev.device_type.unwrap_or_default(),
            fstype: dev.fstype.filter(|f| !f.is_empty()),
            pttype: dev.pttype.filter(|p| !p.is_empty()),
            children: dev
                .children
                .unwrap_or_default()
                .into_iter()
                .map(BlockDevice::from)
                .collect(),
        }
    }
}

/// Parses `lsblk --json --paths` output for a single device.
pub fn parse_lsblk(json: &str) -> Result<BlockDevice> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    output
        .blockdevices
        .into_iter()
        .next()
        .map(BlockDevice::from)
        .ok_or_else(|| Error::LsblkParse {
            message: "lsblk reported no devices".to_string(),
        })
}

/// Inspects `device` and its children.
///
/// Calls `lsblk --json --paths --output NAME,TYPE,FSTYPE,PTTYPE <device>`.
pub fn inspect(
    runner: &dyn CommandRunner,
    device: &Path,
    timeout: std::time::Duration,
) -> Result<BlockDevice> {
    let spec = CommandSpec::new("lsblk")
        .args(["--json", "--paths", "--output", "NAME,TYPE,FSTYPE,PTTYPE"])
        .arg(device.display().to_string())
        .timeout(timeout);

    let output = runner.run(&spec)?.checked(&spec)?;
    parse_lsblk(&output.stdout)
}

#[derive(Debug, Deserialize)]
struct BackingOutput {
    blockdevices: Vec<BackingDevice>,
}

#[derive(Debug, Deserialize)]
struct BackingDevice {
    #[serde(rename = "back-file", default)]
    back_file: Option<String>,
}

/// Parses `lsblk --json --output BACK-FILE` output.
///
/// The kernel appends ` (deleted)` when the backing file was unlinked.
pub fn parse_backing_file(json: &str) -> Result<Option<PathBuf>> {
    let output: BackingOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;
    Ok(output
        .blockdevices
        .into_iter()
        .next()
        .and_then(|dev| dev.back_file)
        .map(|file| file.trim_end_matches(" (deleted)").to_string())
        .filter(|file| !file.is_empty())
        .map(PathBuf::from))
}

/// Returns the file backing loop device `device`.
///
/// `Ok(None)` means the device is gone or no longer backed by a file.
pub fn backing_file(
    runner: &dyn CommandRunner,
    device: &Path,
    timeout: std::time::Duration,
) -> Result<Option<PathBuf>> {
    let spec = CommandSpec::new("lsblk")
        .args(["--nodeps", "--json", "--output", "BACK-FILE"])
        .arg(device.display().to_string())
        .timeout(timeout);

    let output = runner.run(&spec)?;
    if !output.success() {
        return Ok(None);
    }
    parse_backing_file(&output.stdout)
}
