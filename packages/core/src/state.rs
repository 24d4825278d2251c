//! Persisted application state.
//!
//! One JSON document per user holds the last mount, the installed artifacts
//! and the permission flag. Unknown keys are ignored and missing keys take
//! their defaults, so older and newer builds can share the file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{IoResultExt, Result, StateSerializeSnafu};

/// Kind of file written by the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Executable,
    MenuEntry,
    DesktopShortcut,
    Autostart,
}

/// A file the installer actually wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    #[serde(default)]
    pub executable: bool,
}

/// Ordered record of installed artifacts, one entry per destination path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledArtifactSet(Vec<InstalledArtifact>);

impl InstalledArtifactSet {
    /// Records `artifact`, replacing any previous record for the same path.
    pub fn record(&mut self, artifact: InstalledArtifact) {
        match self.0.iter_mut().find(|a| a.path == artifact.path) {
            Some(existing) => *existing = artifact,
            None => self.0.push(artifact),
        }
    }

    /// Removes the record for `path`, returning it if present.
    pub fn forget(&mut self, path: &Path) -> Option<InstalledArtifact> {
        let index = self.0.iter().position(|a| a.path == path)?;
        Some(self.0.remove(index))
    }

    pub fn find(&self, kind: ArtifactKind) -> Option<&InstalledArtifact> {
        self.0.iter().find(|a| a.kind == kind)
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.find(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstalledArtifact> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Last successful mount, enough to unmount it after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMount {
    pub image_path: PathBuf,
    pub mount_point: PathBuf,
    /// Loop device the image was attached to.
    #[serde(default)]
    pub loop_device: Option<PathBuf>,
    /// Device handed to the mount tool (loop device or partition).
    #[serde(default)]
    pub mount_device: Option<PathBuf>,
}

/// Loop device that is still attached although nothing uses it.
///
/// Kept until a later run detaches it. The image path guards against
/// detaching a device number the kernel has since handed to someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDetach {
    pub loop_device: PathBuf,
    pub image_path: PathBuf,
}

/// Persisted permission flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedPermission {
    pub installed: bool,
    pub username: Option<String>,
}

/// Durable per-user state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    pub last_image: Option<PathBuf>,
    pub last_mount: Option<PersistedMount>,
    pub artifacts: InstalledArtifactSet,
    pub permission: PersistedPermission,
    pub autostart: bool,
    pub pending_detach: Vec<PendingDetach>,
    #[serde(skip)]
    location: PathBuf,
}

impl PersistentState {
    /// Empty state that will be saved to `location`.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    /// Loads state from `location`.
    ///
    /// A missing file yields defaults. A corrupt file is logged and replaced
    /// by defaults on the next save.
    pub fn load(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        let content = match fs::read_to_string(&location) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %location.display(), "no saved state, starting fresh");
                return Ok(Self::new(location));
            }
            Err(e) => return Err(e).state_read_context(&location),
        };

        let mut state = match serde_json::from_str::<Self>(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %location.display(), error = %e, "ignoring unreadable state file");
                Self::default()
            }
        };
        state.location = location;
        Ok(state)
    }

    /// Writes the state atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let path = &self.location;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).state_write_context(dir)?;

        let json = serde_json::to_string_pretty(self).context(StateSerializeSnafu)?;
        let mut tmp = NamedTempFile::new_in(dir).state_write_context(path)?;
        tmp.write_all(json.as_bytes()).state_write_context(path)?;
        tmp.write_all(b"\n").state_write_context(path)?;
        tmp.as_file().sync_all().state_write_context(path)?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .state_write_context(path)?;

        debug!(path = %path.display(), "state saved");
        Ok(())
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Remembers a successful mount.
    pub fn record_mount(&mut self, mount: PersistedMount) {
        self.last_image = Some(mount.image_path.clone());
        self.last_mount = Some(mount);
    }

    /// Forgets the last mount; the last image stays for convenience.
    pub fn clear_mount(&mut self) {
        self.last_mount = None;
    }

    /// Remembers that `pending.loop_device` still needs a detach.
    pub fn owe_detach(&mut self, pending: PendingDetach) {
        if !self.pending_detach.contains(&pending) {
            self.pending_detach.push(pending);
        }
    }

    /// Resets everything to defaults, keeping the location.
    pub fn reset(&mut self) {
        let location = std::mem::take(&mut self.location);
        *self = Self::new(location);
    }

    /// Deletes the state file. A missing file is not an error.
    pub fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.location) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(e).state_write_context(&self.location)
            }
            _ => Ok(()),
        }
    }
}
