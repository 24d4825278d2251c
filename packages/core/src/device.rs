//! Image-to-device resolution.
//!
//! An image is always attached as a loop device first. If the loop device
//! exposes partitions (isohybrid images, disk images) the first partition
//! with a recognized filesystem is the mount target; otherwise the loop
//! device itself is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::disk::{self, BlockDevice};
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, CommandSpec, run_best_effort};
use crate::image::ImageReference;
use crate::udisks::Udisks;

/// How the image exposes its filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The loop device carries the filesystem directly.
    DirectFilesystem,
    /// The loop device carries a partition table; a partition is mounted.
    PartitionedImage,
}

/// Result of resolving an image to a mountable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResolution {
    pub kind: DeviceKind,
    /// Loop device attached for this attempt.
    pub loop_device: PathBuf,
    /// Selected partition, for partitioned images.
    pub partition: Option<PathBuf>,
    /// Filesystem reported for the target, if known.
    pub fstype: Option<String>,
}

impl DeviceResolution {
    /// The device to hand to the mount tool.
    pub fn target(&self) -> &Path {
        self.partition.as_deref().unwrap_or(&self.loop_device)
    }
}

/// Picks the mount target from an inspected loop device.
///
/// Partitions are considered in lsblk order; the first one with a
/// recognized filesystem wins. Extended and empty entries are skipped.
pub fn select_target(device: &BlockDevice) -> Result<DeviceResolution> {
    let partitions = device.partitions();

    if partitions.is_empty() {
        return Ok(DeviceResolution {
            kind: DeviceKind::DirectFilesystem,
            loop_device: device.path.clone(),
            partition: None,
            fstype: device.fstype.clone(),
        });
    }

    let chosen = partitions
        .into_iter()
        .find(|part| part.has_recognized_filesystem())
        .ok_or_else(|| Error::NoMountableFilesystem {
            device: device.path.display().to_string(),
        })?;

    Ok(DeviceResolution {
        kind: DeviceKind::PartitionedImage,
        loop_device: device.path.clone(),
        partition: Some(chosen.path.clone()),
        fstype: chosen.fstype.clone(),
    })
}

/// Resolves images to mountable devices.
pub struct DeviceResolver<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        Self { runner, settings }
    }

    /// Attaches `image` and decides what to mount.
    ///
    /// On failure after the attach, the loop device is detached again so no
    /// stray device is left behind.
    pub fn resolve(&self, image: &ImageReference) -> Result<DeviceResolution> {
        let udisks = Udisks::new(self.runner, self.settings);
        let loop_device = udisks.loop_setup(image.path())?;

        match self.inspect(&loop_device) {
            Ok(resolution) => {
                info!(
                    image = %image.path().display(),
                    kind = ?resolution.kind,
                    target = %resolution.target().display(),
                    "resolved image"
                );
                Ok(resolution)
            }
            Err(e) => {
                if let Err(detach) = udisks.loop_delete(&loop_device) {
                    warn!(device = %loop_device.display(), error = %detach, "failed to detach loop device");
                }
                Err(e)
            }
        }
    }

    fn inspect(&self, loop_device: &Path) -> Result<DeviceResolution> {
        self.settle();
        let mut device = disk::inspect(self.runner, loop_device, self.settings.command_timeout)?;

        // Partition table present but no partitions visible yet.
        if device.partitions().is_empty() && device.has_partition_table() {
            debug!(device = %loop_device.display(), "partition table not visible, rescanning");
            self.rescan(loop_device);
            self.settle();
            device = disk::inspect(self.runner, loop_device, self.settings.command_timeout)?;
        }

        select_target(&device)
    }

    /// Waits for udev to finish processing new devices.
    fn settle(&self) {
        self.best_effort(CommandSpec::new("udevadm").arg("settle"));
    }

    /// Asks the kernel to re-read the partition table.
    fn rescan(&self, device: &Path) {
        let device = device.display().to_string();
        let partprobe = CommandSpec::new("partprobe").arg(device.clone());
        if !self.best_effort(partprobe) {
            self.best_effort(CommandSpec::new("blockdev").args(["--rereadpt", device.as_str()]));
        }
    }

    fn best_effort(&self, spec: CommandSpec) -> bool {
        run_best_effort(self.runner, &spec.timeout(self.settings.command_timeout))
    }
}
