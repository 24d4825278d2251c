//! Per-user installation and removal.
//!
//! Every file written here is recorded in the persisted artifact set right
//! after the write succeeds, and uninstall removes exactly what the set
//! lists. A partial install therefore leaves an accurate record behind.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::{APP_ID, APP_NAME, Layout, Settings};
use crate::controller::MountController;
use crate::desktop;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::CommandRunner;
use crate::permission::PermissionManager;
use crate::state::{ArtifactKind, InstalledArtifact, PersistentState};

const EXECUTABLE_MODE: u32 = 0o755;
const ENTRY_MODE: u32 = 0o644;

/// What uninstall did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    /// Artifacts that are gone (including ones that were already missing).
    pub removed: Vec<PathBuf>,
    /// Failsafe unmount failure, if one happened.
    pub failsafe_error: Option<String>,
}

/// Writes and removes the files that make the tool available.
pub struct InstallationManager<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    settings: &'a Settings,
    source_binary: Option<PathBuf>,
}

impl<'a> InstallationManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: &'a Layout, settings: &'a Settings) -> Self {
        Self {
            runner,
            layout,
            settings,
            source_binary: None,
        }
    }

    /// Installs `path` instead of the running executable.
    pub fn with_source_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_binary = Some(path.into());
        self
    }

    /// Copies the executable and writes the desktop entries.
    ///
    /// The autostart entry is written when `autostart` is set or when it
    /// was enabled before. Returns the paths written, in order.
    pub fn install(&self, state: &mut PersistentState, autostart: bool) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        let binary = self.layout.installed_binary();
        self.copy_executable(&binary)?;
        self.record(state, ArtifactKind::Executable, &binary, true)?;
        written.push(binary.clone());

        let menu_entry = self.layout.menu_entry();
        write_atomic(&menu_entry, menu_entry_text(&binary).as_bytes(), ENTRY_MODE)?;
        self.record(state, ArtifactKind::MenuEntry, &menu_entry, false)?;
        written.push(menu_entry);

        // File managers only launch desktop shortcuts that are executable.
        let shortcut = self.layout.desktop_shortcut();
        write_atomic(&shortcut, menu_entry_text(&binary).as_bytes(), EXECUTABLE_MODE)?;
        self.record(state, ArtifactKind::DesktopShortcut, &shortcut, true)?;
        written.push(shortcut);

        if autostart || state.autostart {
            written.push(self.write_autostart(state, &binary)?);
        }

        desktop::refresh_menus(
            self.runner,
            &self.layout.applications_dir,
            self.settings.command_timeout,
        );
        info!(artifacts = written.len(), "installation complete");
        Ok(written)
    }

    /// Writes or removes only the autostart entry.
    pub fn toggle_autostart(&self, state: &mut PersistentState, enabled: bool) -> Result<()> {
        if enabled {
            let binary = match state.artifacts.find(ArtifactKind::Executable) {
                Some(artifact) => artifact.path.clone(),
                None => self.source_binary()?,
            };
            self.write_autostart(state, &binary)?;
        } else {
            let entry = self.layout.autostart_entry();
            remove_if_present(&entry).artifact_context(&entry)?;
            state.artifacts.forget(&entry);
            state.autostart = false;
            state.save()?;
            info!(path = %entry.display(), "autostart disabled");
        }
        Ok(())
    }

    /// True when an executable was installed and every recorded file exists.
    pub fn is_installed(&self, state: &PersistentState) -> bool {
        state.artifacts.contains(ArtifactKind::Executable)
            && state.artifacts.iter().all(|artifact| artifact.path.exists())
    }

    /// Removes everything [`install`](Self::install) recorded, plus the
    /// permission rule and the state file.
    ///
    /// An active mount is unmounted first; if that fails the error is
    /// reported but uninstall continues. The permission rule is always
    /// removed. Artifacts that cannot be removed stay recorded and fail the
    /// call with [`Error::UninstallIncomplete`] after the rule is gone.
    pub fn uninstall(
        &self,
        controller: &mut MountController,
        permissions: &PermissionManager<'_>,
        state: &mut PersistentState,
    ) -> Result<UninstallReport> {
        let mut report = UninstallReport::default();

        if let Err(e) = controller.failsafe_unmount(state) {
            warn!(error = %e, "failsafe unmount failed, continuing uninstall");
            report.failsafe_error = Some(match &e {
                Error::FailsafeUnmount { source } => source.to_string(),
                other => other.to_string(),
            });
        }

        let recorded: Vec<InstalledArtifact> = state.artifacts.iter().cloned().collect();
        let mut left_behind = Vec::new();
        for artifact in recorded {
            match remove_if_present(&artifact.path) {
                Ok(()) => {
                    debug!(path = %artifact.path.display(), "removed artifact");
                    state.artifacts.forget(&artifact.path);
                    report.removed.push(artifact.path);
                }
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "failed to remove artifact");
                    left_behind.push(artifact.path);
                }
            }
        }
        state.autostart = state.artifacts.contains(ArtifactKind::Autostart);
        state.save()?;

        // The rule goes even when files were left behind.
        permissions.remove(state)?;

        if !left_behind.is_empty() {
            state.save()?;
            return Err(Error::UninstallIncomplete { paths: left_behind });
        }

        if let Err(e) = remove_if_present(&self.layout.staged_rule()) {
            debug!(error = %e, "failed to remove staged rule");
        }
        for dir in [
            &self.layout.applications_dir,
            &self.layout.bin_dir,
            &self.layout.cache_dir,
        ] {
            remove_dir_if_empty(dir);
        }

        state.reset();
        state.remove_file()?;
        if let Some(dir) = state.location().parent() {
            remove_dir_if_empty(dir);
        }

        desktop::refresh_menus(
            self.runner,
            &self.layout.applications_dir,
            self.settings.command_timeout,
        );
        info!(removed = report.removed.len(), "uninstall complete");
        Ok(report)
    }

    fn write_autostart(&self, state: &mut PersistentState, binary: &Path) -> Result<PathBuf> {
        let entry = self.layout.autostart_entry();
        write_atomic(&entry, autostart_entry_text(binary).as_bytes(), ENTRY_MODE)?;
        state.autostart = true;
        self.record(state, ArtifactKind::Autostart, &entry, false)?;
        info!(path = %entry.display(), "autostart enabled");
        Ok(entry)
    }

    fn source_binary(&self) -> Result<PathBuf> {
        match &self.source_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().artifact_context(self.layout.installed_binary()),
        }
    }

    fn copy_executable(&self, destination: &Path) -> Result<()> {
        let source = self.source_binary()?;

        let same_file = match (fs::canonicalize(&source), fs::canonicalize(destination)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same_file {
            debug!(path = %destination.display(), "already running the installed copy");
            return Ok(());
        }

        let bytes = fs::read(&source).artifact_context(&source)?;
        write_atomic(destination, &bytes, EXECUTABLE_MODE)
    }

    fn record(
        &self,
        state: &mut PersistentState,
        kind: ArtifactKind,
        path: &Path,
        executable: bool,
    ) -> Result<()> {
        state.artifacts.record(InstalledArtifact {
            kind,
            path: path.to_path_buf(),
            executable,
        });
        state.save()
    }
}

/// Writes `contents` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).artifact_context(dir)?;

    let mut tmp = NamedTempFile::new_in(dir).artifact_context(path)?;
    tmp.write_all(contents).artifact_context(path)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .artifact_context(path)?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .artifact_context(path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
    if empty && fs::remove_dir(dir).is_ok() {
        debug!(path = %dir.display(), "removed empty directory");
    }
}

/// Quotes one argument for a desktop entry `Exec` key.
fn quote_exec_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        match c {
            '"' | '`' | '$' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '%' => quoted.push_str("%%"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Menu entry and desktop shortcut: opening an image with it mounts it,
/// launching it bare remounts the last image.
fn menu_entry_text(binary: &Path) -> String {
    let exec = quote_exec_arg(&binary.to_string_lossy());
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={APP_NAME}\n\
         Comment=Mount ISO images without password prompts\n\
         Exec={exec} mount %f\n\
         Icon=media-optical\n\
         Terminal=true\n\
         Categories=Utility;System;\n\
         MimeType=application/x-cd-image;application/x-iso9660-image;\n\
         X-{APP_ID}-Managed=true\n"
    )
}

/// Autostart entry: reconciles saved state at login.
fn autostart_entry_text(binary: &Path) -> String {
    let exec = quote_exec_arg(&binary.to_string_lossy());
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={APP_NAME}\n\
         Comment=Restore {APP_NAME} state on login\n\
         Exec={exec} status\n\
         Icon=media-optical\n\
         Terminal=false\n\
         X-GNOME-Autostart-enabled=true\n\
         X-{APP_ID}-Managed=true\n"
    )
}
