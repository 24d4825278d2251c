//! Validated references to image files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// Extension recognized as a mountable image.
pub const IMAGE_EXTENSION: &str = "iso";

/// Absolute path to an existing `.iso` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ImageReference(PathBuf);

impl ImageReference {
    /// Validates `path` and resolves it to an absolute path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |reason: &str| Error::InvalidImage {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let has_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION));
        if !has_extension {
            return Err(invalid("expected an .iso file"));
        }

        let absolute = fs::canonicalize(path).map_err(|_| invalid("file does not exist"))?;
        if !absolute.is_file() {
            return Err(invalid("not a regular file"));
        }

        Ok(Self(absolute))
    }

    /// Wraps a path recorded by an earlier run without re-validating it.
    ///
    /// The file may have been moved while its loop device kept it alive.
    pub(crate) fn from_persisted(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name for status messages.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl AsRef<Path> for ImageReference {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}
