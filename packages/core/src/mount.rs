//! Mount table inspection.
//!
//! Reads `/proc/mounts` (same field layout as fstab) to find out whether a
//! mount point is still active, independent of what udisks last told us.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device (e.g. "/dev/loop0p1").
    pub device: PathBuf,
    /// Mount point path, with octal escapes decoded.
    pub mount_point: PathBuf,
    /// Filesystem type (e.g. "iso9660").
    pub vfs_type: String,
}

impl MountEntry {
    /// Parses a single mount table line.
    ///
    /// Returns None for lines with fewer than three fields.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let device = parts.next()?;
        let mount_point = parts.next()?;
        let vfs_type = parts.next()?;

        Some(Self {
            device: PathBuf::from(unescape_mount_path(device)),
            mount_point: PathBuf::from(unescape_mount_path(mount_point)),
            vfs_type: vfs_type.to_string(),
        })
    }
}

/// Parses mount table content.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(MountEntry::from_line).collect()
}

/// Reads and parses the mount table at `path`.
pub fn read_mount_table(path: &Path) -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string(path).map_err(|source| Error::MountTableRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_mount_table(&content))
}

/// Checks whether `mount_point` is mounted, optionally by a specific device.
pub fn is_mounted(table: &Path, mount_point: &Path, device: Option<&Path>) -> Result<bool> {
    Ok(read_mount_table(table)?.iter().any(|entry| {
        entry.mount_point == mount_point && device.is_none_or(|dev| entry.device == dev)
    }))
}

/// Finds where `device` is mounted, if anywhere.
pub fn find_mount_point(table: &Path, device: &Path) -> Result<Option<PathBuf>> {
    Ok(read_mount_table(table)?
        .into_iter()
        .find(|entry| entry.device == device)
        .map(|entry| entry.mount_point))
}

/// Unescapes octal sequences (`\040` etc.) used in mount table paths.
fn unescape_mount_path(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let octal: String = chars.clone().take(3).collect();
            if octal.len() == 3
                && octal.chars().all(|d| ('0'..='7').contains(&d))
                && let Ok(byte) = u8::from_str_radix(&octal, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}
