//! Filesystem layout and runtime settings.
//!
//! Every fixed path the tool touches lives in [`Layout`], so tests (and
//! packagers) can relocate the whole tree with [`Layout::rooted_at`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::PrivilegeEscalation;

/// Application identifier used for file names and directories.
pub const APP_ID: &str = "isomount";

/// Human-readable application name used in desktop entries.
pub const APP_NAME: &str = "ISO Mount";

/// System-wide location of the polkit rule we manage.
pub const POLKIT_RULE_PATH: &str = "/etc/polkit-1/rules.d/90-isomount.rules";

/// Kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Default timeout for unprivileged tool invocations.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Default timeout for privileged invocations that may show a password dialog.
pub const DEFAULT_PRIVILEGED_TIMEOUT_SECS: u64 = 300;

/// Default udisks mount options.
pub const DEFAULT_MOUNT_OPTIONS: &str = "ro";

/// Every per-user and system path used by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Per-user binary directory (`~/.local/bin`).
    pub bin_dir: PathBuf,
    /// Application menu directory (`~/.local/share/applications`).
    pub applications_dir: PathBuf,
    /// User desktop directory.
    pub desktop_dir: PathBuf,
    /// Autostart directory (`~/.config/autostart`).
    pub autostart_dir: PathBuf,
    /// Persisted state file.
    pub state_file: PathBuf,
    /// Scratch directory for generated files.
    pub cache_dir: PathBuf,
    /// Installed polkit rule.
    pub polkit_rule: PathBuf,
    /// Mount table consulted during reconciliation.
    pub mount_table: PathBuf,
}

impl Layout {
    /// Builds the layout for the invoking user from XDG base directories.
    pub fn for_current_user() -> Result<Self> {
        let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
        let data = dirs::data_dir().unwrap_or_else(|| home.join(".local").join("share"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        let desktop = dirs::desktop_dir().unwrap_or_else(|| home.join("Desktop"));

        Ok(Self {
            bin_dir: dirs::executable_dir().unwrap_or_else(|| home.join(".local").join("bin")),
            applications_dir: data.join("applications"),
            desktop_dir: desktop,
            autostart_dir: config.join("autostart"),
            state_file: config.join(APP_ID).join("config.json"),
            cache_dir: cache.join(APP_ID),
            polkit_rule: PathBuf::from(POLKIT_RULE_PATH),
            mount_table: PathBuf::from(PROC_MOUNTS),
        })
    }

    /// Builds a layout where every path lives below `root`.
    ///
    /// The polkit rule and mount table are relocated too, which makes the
    /// layout usable without root privileges.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            bin_dir: root.join(".local").join("bin"),
            applications_dir: root.join(".local").join("share").join("applications"),
            desktop_dir: root.join("Desktop"),
            autostart_dir: root.join(".config").join("autostart"),
            state_file: root.join(".config").join(APP_ID).join("config.json"),
            cache_dir: root.join(".cache").join(APP_ID),
            polkit_rule: root
                .join("etc")
                .join("polkit-1")
                .join("rules.d")
                .join("90-isomount.rules"),
            mount_table: root.join("proc").join("mounts"),
        }
    }

    /// Overrides the polkit rule location.
    pub fn with_polkit_rule(mut self, path: impl Into<PathBuf>) -> Self {
        self.polkit_rule = path.into();
        self
    }

    /// Overrides the mount table location.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    /// Installed copy of the executable.
    pub fn installed_binary(&self) -> PathBuf {
        self.bin_dir.join(APP_ID)
    }

    /// Application menu entry.
    pub fn menu_entry(&self) -> PathBuf {
        self.applications_dir.join(format!("{APP_ID}.desktop"))
    }

    /// Desktop shortcut.
    pub fn desktop_shortcut(&self) -> PathBuf {
        self.desktop_dir.join(format!("{APP_ID}.desktop"))
    }

    /// Autostart entry.
    pub fn autostart_entry(&self) -> PathBuf {
        self.autostart_dir.join(format!("{APP_ID}.desktop"))
    }

    /// Scratch copy of the generated polkit rule.
    pub fn staged_rule(&self) -> PathBuf {
        self.cache_dir.join("90-isomount.rules")
    }
}

/// Runtime knobs for external command execution and mounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// How privileged commands are escalated.
    pub escalation: PrivilegeEscalation,
    /// Timeout for ordinary tool invocations.
    pub command_timeout: Duration,
    /// Timeout for privileged invocations (includes the password dialog).
    pub privileged_timeout: Duration,
    /// Options passed to `udisksctl mount --options`.
    pub mount_options: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            escalation: PrivilegeEscalation::Pkexec,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            privileged_timeout: Duration::from_secs(DEFAULT_PRIVILEGED_TIMEOUT_SECS),
            mount_options: DEFAULT_MOUNT_OPTIONS.to_string(),
        }
    }
}

impl Settings {
    /// Creates settings with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the privilege escalation method.
    pub fn with_escalation(mut self, escalation: PrivilegeEscalation) -> Self {
        self.escalation = escalation;
        self
    }

    /// Sets the ordinary command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}
