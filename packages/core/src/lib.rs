//! isomount-core: Core library for prompt-free ISO image mounting.
//!
//! This library resolves image files to mountable block devices, drives
//! udisks through a mount/unmount state machine, manages the polkit rule
//! that makes those calls unprivileged, and installs or removes the
//! per-user artifacts that keep the tool available.
//!
//! # Modules
//!
//! - [`executor`]: External command execution with timeouts and escalation
//! - [`disk`]: Block device inspection using `lsblk`
//! - [`udisks`]: `udisksctl` loop setup, mount, unmount and teardown
//! - [`device`]: Image-to-device resolution
//! - [`mount`]: Mount table inspection
//! - [`permission`]: Polkit rule management
//! - [`controller`]: Mount state machine
//! - [`install`]: Per-user installation and uninstallation
//! - [`state`]: Persisted state
//! - [`engine`]: Facade owning all of the above
//! - [`service`]: Worker thread around the engine
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use isomount_core::{Engine, Layout, NullSink, Settings};
//!
//! let layout = Layout::for_current_user().unwrap();
//! let mut engine = Engine::new(layout, Settings::default(), Arc::new(NullSink)).unwrap();
//! engine.startup().unwrap();
//!
//! if !engine.permission_status().installed {
//!     engine.fix_permissions().unwrap();
//! }
//! let session = engine.mount(Path::new("/home/deck/Downloads/ubuntu.iso")).unwrap();
//! println!("mounted at {}", session.mount_point.display());
//! ```

pub mod config;
pub mod controller;
pub mod desktop;
pub mod device;
pub mod disk;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod image;
pub mod install;
pub mod mount;
pub mod permission;
pub mod service;
pub mod state;
pub mod udisks;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{Layout, Settings};
pub use controller::{MountController, MountSession, MountState};
pub use device::{DeviceKind, DeviceResolution};
pub use engine::{Engine, StatusReport};
pub use error::{Error, Result};
pub use event::{Event, EventSink, NullSink};
pub use executor::{ExecutionContext, PrivilegeEscalation};
pub use image::ImageReference;
pub use permission::{FixOutcome, PermissionRuleStatus};
pub use service::{Request, Response, Service, Ticket};
pub use state::PersistentState;
