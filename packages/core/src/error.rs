//! Unified error types for the isomount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to launch a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command did not finish within its timeout and was killed.
    #[snafu(display("command '{command}' timed out after {}s", timeout.as_secs()))]
    CommandTimeout { command: String, timeout: Duration },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A required external tool is not installed.
    #[snafu(display("required tool '{tool}' not found ({hint})"))]
    ToolNotFound { tool: String, hint: String },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// The kernel mount table cannot be read.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTableRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The selected file is not a usable image.
    #[snafu(display("invalid image {}: {reason}", path.display()))]
    InvalidImage { path: PathBuf, reason: String },

    /// Mount attempted before the permission rule was installed.
    #[snafu(display("permissions are not configured; run fix-permissions first"))]
    PermissionsNotConfigured,

    /// A mount session is active or an operation is in flight.
    #[snafu(display("mount session is busy ({state})"))]
    SessionBusy { state: String },

    /// Unmount requested while nothing is mounted.
    #[snafu(display("nothing is mounted"))]
    NoActiveSession,

    /// udisks could not attach the image as a loop device.
    #[snafu(display("loop-setup failed: {message}"))]
    LoopAttach { message: String },

    /// The image exposes no partition with a filesystem we can mount.
    #[snafu(display("no mountable filesystem found on {device}"))]
    NoMountableFilesystem { device: String },

    /// The privileged mount tool reported a failure.
    #[snafu(display("{action} failed with code {code}: {stderr}"))]
    MountTool {
        action: String,
        code: i32,
        stderr: String,
    },

    /// The privileged copy of the permission rule was denied or cancelled.
    #[snafu(display("failed to install permission rule at {}: {message}", path.display()))]
    PermissionRuleWrite { path: PathBuf, message: String },

    /// The permission rule was written but does not look as expected.
    #[snafu(display("permission rule at {} failed verification: {message}", path.display()))]
    PermissionRuleVerify { path: PathBuf, message: String },

    /// The username cannot be embedded in a permission rule.
    #[snafu(display("username '{name}' contains characters not allowed in a rule"))]
    InvalidUsername { name: String },

    /// The current user could not be determined.
    #[snafu(display("could not determine the current user: {message}"))]
    UserLookup { message: String },

    /// Home directory not found.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    /// Writing an installation artifact failed.
    #[snafu(display("failed to write artifact {}", path.display()))]
    InstallArtifactWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Some recorded artifacts could not be removed during uninstall.
    #[snafu(display("uninstall left {} artifact(s) behind", paths.len()))]
    UninstallIncomplete { paths: Vec<PathBuf> },

    /// Best-effort unmount during uninstall failed.
    #[snafu(display("failsafe unmount failed"))]
    FailsafeUnmount {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// State file exists but cannot be read.
    #[snafu(display("failed to read state at {}", path.display()))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// State file cannot be written.
    #[snafu(display("failed to write state at {}", path.display()))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// State could not be serialized.
    #[snafu(display("failed to serialize state"))]
    StateSerialize { source: serde_json::Error },

    /// The worker thread is gone.
    #[snafu(display("worker unavailable: {message}"))]
    Worker { message: String },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command launch errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for state read errors.
    fn state_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for state write errors.
    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for artifact write errors.
    fn artifact_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn state_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateReadSnafu { path: path.into() })
    }

    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateWriteSnafu { path: path.into() })
    }

    fn artifact_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(InstallArtifactWriteSnafu { path: path.into() })
    }
}

impl Error {
    /// Returns a remediation hint suitable for showing next to the message.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Error::ToolNotFound { hint, .. } => Some(hint.as_str()),
            Error::PermissionsNotConfigured => {
                Some("install the permission rule with 'isomount fix-permissions'")
            }
            Error::SessionBusy { .. } => {
                Some("wait for the current operation or unmount the current image first")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_tool_error_keeps_stderr_verbatim() {
        let err = Error::MountTool {
            action: "udisksctl mount".to_string(),
            code: 1,
            stderr: "Error mounting /dev/loop0: wrong fs type".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "udisksctl mount failed with code 1: Error mounting /dev/loop0: wrong fs type"
        );
    }

    #[test]
    fn test_io_context_wraps_path() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = io.artifact_context("/home/u/.local/bin/isomount").unwrap_err();
        assert!(matches!(err, Error::InstallArtifactWrite { .. }));
        assert!(err.to_string().contains("/home/u/.local/bin/isomount"));
    }

    #[test]
    fn test_hint_for_missing_tool() {
        let err = Error::ToolNotFound {
            tool: "udisksctl".to_string(),
            hint: "install udisks2".to_string(),
        };
        assert_eq!(err.hint(), Some("install udisks2"));
        assert!(Error::NoActiveSession.hint().is_none());
    }
}
