//! State-change notifications for frontends.

use std::path::PathBuf;
use std::sync::mpsc;

use serde::Serialize;

use crate::controller::MountState;

/// Something a frontend may want to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        from: MountState,
        to: MountState,
    },
    Mounted {
        image: PathBuf,
        device: PathBuf,
        mount_point: PathBuf,
    },
    Unmounted {
        mount_point: PathBuf,
    },
    /// A mount from a previous run is still active and was adopted.
    SessionRestored {
        mount_point: PathBuf,
    },
    /// A recorded mount is gone and was forgotten.
    StaleMountCleared {
        mount_point: PathBuf,
    },
    PermissionsInstalled {
        rule_path: PathBuf,
    },
    Installed {
        artifacts: Vec<PathBuf>,
    },
    Uninstalled,
    /// The frontend should exit.
    TerminationRequested,
    Failed {
        operation: String,
        message: String,
    },
}

/// Receives events from the core.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for mpsc::Sender<Event> {
    fn emit(&self, event: Event) {
        // A closed receiver just means nobody is listening.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}
