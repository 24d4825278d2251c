//! udisksctl invocations.
//!
//! udisks is the privileged mount tool: it performs loop setup, mount,
//! unmount and loop teardown on our behalf, gated by polkit. Every call
//! passes `--no-user-interaction` so a missing rule fails instead of
//! prompting.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandRunner, CommandSpec};

const UDISKSCTL: &str = "udisksctl";
const NO_INTERACTION: &str = "--no-user-interaction";

/// Thin client over `udisksctl`.
pub struct Udisks<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
}

impl<'a> Udisks<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        Self { runner, settings }
    }

    /// Attaches `image` read-only as a loop device and returns its path.
    pub fn loop_setup(&self, image: &Path) -> Result<PathBuf> {
        let spec = self
            .spec("loop-setup")
            .args(["-r", "-f"])
            .arg(image.display().to_string())
            .arg(NO_INTERACTION);

        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(Error::LoopAttach {
                message: output.message().to_string(),
            });
        }

        let device = parse_loop_device(&output.stdout).ok_or_else(|| Error::LoopAttach {
            message: format!("loop device not found in output: {}", output.stdout.trim()),
        })?;
        debug!(image = %image.display(), device = %device.display(), "loop device attached");
        Ok(device)
    }

    /// Detaches a loop device.
    pub fn loop_delete(&self, device: &Path) -> Result<()> {
        let spec = self
            .spec("loop-delete")
            .arg("-b")
            .arg(device.display().to_string())
            .arg(NO_INTERACTION);
        let output = self.runner.run(&spec)?;
        check(&spec, output).map(|_| ())
    }

    /// Mounts `device` and returns the mount point udisks chose.
    ///
    /// Returns `Ok(None)` when the mount succeeded but the output did not
    /// name a mount point.
    pub fn mount(&self, device: &Path) -> Result<Option<PathBuf>> {
        let spec = self
            .spec("mount")
            .arg("-b")
            .arg(device.display().to_string())
            .args(["--options", self.settings.mount_options.as_str()])
            .arg(NO_INTERACTION);
        let output = check(&spec, self.runner.run(&spec)?)?;
        Ok(parse_mount_point(&output.stdout))
    }

    /// Unmounts `device`.
    pub fn unmount(&self, device: &Path) -> Result<()> {
        let spec = self
            .spec("unmount")
            .arg("-b")
            .arg(device.display().to_string())
            .arg(NO_INTERACTION);
        let output = self.runner.run(&spec)?;
        check(&spec, output).map(|_| ())
    }

    fn spec(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new(UDISKSCTL)
            .arg(subcommand)
            .timeout(self.settings.command_timeout)
    }
}

/// Maps a failed udisks invocation to [`Error::MountTool`], keeping stderr verbatim.
fn check(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(Error::MountTool {
        action: format!(
            "{} {}",
            spec.program(),
            spec.arguments().first().map(String::as_str).unwrap_or_default()
        ),
        code: output.exit_code,
        stderr: output.message().to_string(),
    })
}

/// Extracts the loop device from `Mapped file X as /dev/loopN.`
///
/// The device is whatever follows the last " as ", so image paths that
/// contain " as " or "/dev/loop" do not confuse it.
pub fn parse_loop_device(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let (_, device) = line.trim().rsplit_once(" as ")?;
        let device = device.trim_end_matches('.').trim();
        device
            .starts_with("/dev/loop")
            .then(|| PathBuf::from(device))
    })
}

/// Extracts the mount point from `Mounted /dev/loop0 at /run/media/u/LABEL.`
///
/// The mount point is everything after the first " at ", so labels with
/// spaces survive.
pub fn parse_mount_point(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix("Mounted ")?;
        let (_, mount_point) = rest.split_once(" at ")?;
        let mount_point = mount_point.trim_end_matches('.').trim();
        (!mount_point.is_empty()).then(|| PathBuf::from(mount_point))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeRunner};

    #[test]
    fn test_parse_loop_device() {
        assert_eq!(
            parse_loop_device("Mapped file /home/u/disk.iso as /dev/loop12.\n"),
            Some(PathBuf::from("/dev/loop12"))
        );
        assert_eq!(parse_loop_device("nothing useful"), None);
    }

    #[test]
    fn test_parse_loop_device_ignores_image_path() {
        assert_eq!(
            parse_loop_device("Mapped file /home/u/copy of /dev/loop3 as backup.iso as /dev/loop7.\n"),
            Some(PathBuf::from("/dev/loop7"))
        );
    }

    #[test]
    fn test_parse_mount_point_with_spaces() {
        assert_eq!(
            parse_mount_point("Mounted /dev/loop0p1 at /run/media/alice/Ubuntu 24.04 LTS amd64.\n"),
            Some(PathBuf::from("/run/media/alice/Ubuntu 24.04 LTS amd64"))
        );
        assert_eq!(
            parse_mount_point("Mounted /dev/loop0 at /media/DISK\n"),
            Some(PathBuf::from("/media/DISK"))
        );
        assert_eq!(parse_mount_point("Error mounting"), None);
    }

    #[test]
    fn test_loop_setup_failure_is_loop_attach() {
        let runner = FakeRunner::new();
        runner.respond(
            "udisksctl",
            Some("loop-setup"),
            testing::fail(1, "Error setting up loop device"),
        );
        let settings = Settings::default();
        let udisks = Udisks::new(&runner, &settings);

        let err = udisks.loop_setup(Path::new("/images/disk.iso")).unwrap_err();
        assert!(matches!(err, Error::LoopAttach { .. }));
    }

    #[test]
    fn test_mount_passes_read_only_and_no_interaction() {
        let runner = FakeRunner::new();
        testing::script_udisks(&runner, "/dev/loop0", "/run/media/u/DISK");
        let settings = Settings::default();
        let udisks = Udisks::new(&runner, &settings);

        let mp = udisks.mount(Path::new("/dev/loop0")).unwrap();
        assert_eq!(mp, Some(PathBuf::from("/run/media/u/DISK")));
        assert_eq!(
            runner.udisks_calls(),
            vec!["udisksctl mount -b /dev/loop0 --options ro --no-user-interaction"]
        );
    }

    #[test]
    fn test_unmount_failure_keeps_stderr() {
        let runner = FakeRunner::new();
        runner.respond(
            "udisksctl",
            Some("unmount"),
            testing::fail(1, "target is busy"),
        );
        let settings = Settings::default();
        let udisks = Udisks::new(&runner, &settings);

        match udisks.unmount(Path::new("/dev/loop0")).unwrap_err() {
            Error::MountTool { action, code, stderr } => {
                assert_eq!(action, "udisksctl unmount");
                assert_eq!(code, 1);
                assert_eq!(stderr, "target is busy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
