//! Mount/unmount state machine.
//!
//! ```text
//! Idle -> Resolving -> Mounting -> Mounted -> Unmounting -> Idle
//!            \            \                      \
//!             +------------+--> Failed(reason) <--+
//! ```
//!
//! `Failed` is transient: it is published, then the controller returns to
//! `Idle` (or back to `Mounted` when an unmount failed, since the session
//! is still live). There is a single mount slot; requests that do not fit
//! the current state are rejected, never queued.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::desktop;
use crate::device::{DeviceKind, DeviceResolver};
use crate::disk;
use crate::error::{Error, FailsafeUnmountSnafu, Result};
use crate::event::{Event, EventSink};
use crate::executor::CommandRunner;
use crate::image::ImageReference;
use crate::mount;
use crate::permission::PermissionRuleStatus;
use crate::state::{PendingDetach, PersistedMount, PersistentState};
use crate::udisks::Udisks;

/// Controller state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Idle,
    Resolving,
    Mounting,
    Mounted,
    Unmounting,
    Failed(String),
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Resolving => f.write_str("resolving"),
            Self::Mounting => f.write_str("mounting"),
            Self::Mounted => f.write_str("mounted"),
            Self::Unmounting => f.write_str("unmounting"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The single active mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSession {
    pub image: ImageReference,
    pub kind: DeviceKind,
    /// Loop device to detach after unmounting, if known.
    pub loop_device: Option<PathBuf>,
    /// Device that is mounted.
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

impl MountSession {
    fn to_persisted(&self) -> PersistedMount {
        PersistedMount {
            image_path: self.image.path().to_path_buf(),
            mount_point: self.mount_point.clone(),
            loop_device: self.loop_device.clone(),
            mount_device: Some(self.device.clone()),
        }
    }
}

/// Drives udisks through the mount lifecycle.
pub struct MountController {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
    mount_table: PathBuf,
    sink: Arc<dyn EventSink>,
    state: MountState,
    session: Option<MountSession>,
}

impl MountController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: Settings,
        mount_table: impl Into<PathBuf>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            runner,
            settings,
            mount_table: mount_table.into(),
            sink,
            state: MountState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> &MountState {
        &self.state
    }

    pub fn session(&self) -> Option<&MountSession> {
        self.session.as_ref()
    }

    /// Resolves and mounts `image`.
    ///
    /// Allowed only from `Idle` and only with the permission rule in place;
    /// otherwise fails without running anything. A failed attempt detaches
    /// the loop device it attached.
    pub fn request_mount(
        &mut self,
        image: &ImageReference,
        permission: &PermissionRuleStatus,
        state: &mut PersistentState,
    ) -> Result<MountSession> {
        if self.state != MountState::Idle {
            return Err(Error::SessionBusy {
                state: self.state.to_string(),
            });
        }
        if !permission.installed {
            return Err(Error::PermissionsNotConfigured);
        }

        self.transition(MountState::Resolving);
        let session = match self.mount_image(image) {
            Ok(session) => session,
            Err(e) => {
                self.fail("mount", &e, MountState::Idle);
                return Err(e);
            }
        };

        state.record_mount(session.to_persisted());
        save_or_warn(state);

        self.session = Some(session.clone());
        self.transition(MountState::Mounted);
        info!(
            image = %session.image.path().display(),
            device = %session.device.display(),
            mount_point = %session.mount_point.display(),
            "image mounted"
        );
        self.sink.emit(Event::Mounted {
            image: session.image.path().to_path_buf(),
            device: session.device.clone(),
            mount_point: session.mount_point.clone(),
        });
        desktop::refresh_file_manager(self.runner.as_ref(), self.settings.command_timeout);

        Ok(session)
    }

    fn mount_image(&mut self, image: &ImageReference) -> Result<MountSession> {
        let resolution =
            DeviceResolver::new(self.runner.as_ref(), &self.settings).resolve(image)?;

        self.transition(MountState::Mounting);
        let udisks = Udisks::new(self.runner.as_ref(), &self.settings);
        let target = resolution.target().to_path_buf();

        let reported = match udisks.mount(&target) {
            Ok(reported) => reported,
            Err(e) => {
                detach_or_warn(&udisks, &resolution.loop_device);
                return Err(e);
            }
        };

        let mount_point = match reported {
            Some(mount_point) => mount_point,
            None => match mount::find_mount_point(&self.mount_table, &target) {
                Ok(Some(mount_point)) => mount_point,
                lookup => {
                    if let Err(e) = lookup {
                        warn!(error = %e, "mount table lookup failed");
                    }
                    if let Err(e) = udisks.unmount(&target) {
                        warn!(device = %target.display(), error = %e, "rollback unmount failed");
                    }
                    detach_or_warn(&udisks, &resolution.loop_device);
                    return Err(Error::MountTool {
                        action: "udisksctl mount".to_string(),
                        code: 0,
                        stderr: "mount point was not reported".to_string(),
                    });
                }
            },
        };

        Ok(MountSession {
            image: image.clone(),
            kind: resolution.kind,
            loop_device: Some(resolution.loop_device.clone()),
            device: target,
            mount_point,
        })
    }

    /// Unmounts the active session and detaches its loop device.
    ///
    /// Returns the mount point that was released.
    pub fn request_unmount(&mut self, state: &mut PersistentState) -> Result<PathBuf> {
        let session = match (&self.state, &self.session) {
            (MountState::Mounted, Some(session)) => session.clone(),
            (MountState::Idle | MountState::Mounted, _) => return Err(Error::NoActiveSession),
            (other, _) => {
                return Err(Error::SessionBusy {
                    state: other.to_string(),
                });
            }
        };

        self.transition(MountState::Unmounting);
        let stray = match self.unmount_session(&session) {
            Ok(stray) => stray,
            Err(e) => {
                self.fail("unmount", &e, MountState::Mounted);
                return Err(e);
            }
        };

        self.session = None;
        state.clear_mount();
        if let Some(loop_device) = stray {
            state.owe_detach(PendingDetach {
                loop_device,
                image_path: session.image.path().to_path_buf(),
            });
        }
        save_or_warn(state);

        self.transition(MountState::Idle);
        info!(mount_point = %session.mount_point.display(), "image unmounted");
        self.sink.emit(Event::Unmounted {
            mount_point: session.mount_point.clone(),
        });
        Ok(session.mount_point)
    }

    /// Unmounts and detaches. Returns the loop device if it stayed attached.
    fn unmount_session(&self, session: &MountSession) -> Result<Option<PathBuf>> {
        let udisks = Udisks::new(self.runner.as_ref(), &self.settings);

        if let Err(e) = udisks.unmount(&session.device) {
            let still_mounted = mount::is_mounted(
                &self.mount_table,
                &session.mount_point,
                Some(&session.device),
            )
            .unwrap_or(true);
            if still_mounted {
                return Err(e);
            }
            warn!(error = %e, "unmount reported an error but the mount is gone");
        }

        Ok(session
            .loop_device
            .as_ref()
            .filter(|loop_device| !detach_or_warn(&udisks, loop_device))
            .cloned())
    }

    /// Adopts or forgets the mount recorded by a previous run.
    ///
    /// A recorded mount that the mount table still shows (same mount point
    /// and, when known, same device) becomes the active session without
    /// touching udisks. Anything else is cleared from the saved state and
    /// its loop device is detached if it still backs the same image.
    pub fn reconcile_on_startup(
        &mut self,
        state: &mut PersistentState,
    ) -> Result<Option<MountSession>> {
        if self.state != MountState::Idle {
            return Ok(self.session.clone());
        }
        let restored = self.adopt_recorded_mount(state);
        self.detach_pending(state);
        Ok(restored)
    }

    fn adopt_recorded_mount(&mut self, state: &mut PersistentState) -> Option<MountSession> {
        let persisted = state.last_mount.clone()?;

        let table = match mount::read_mount_table(&self.mount_table) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "cannot read mount table, keeping saved mount");
                return None;
            }
        };

        let live = table.into_iter().find(|entry| {
            entry.mount_point == persisted.mount_point
                && persisted
                    .mount_device
                    .as_deref()
                    .is_none_or(|device| entry.device == device)
        });

        let Some(entry) = live else {
            info!(mount_point = %persisted.mount_point.display(), "clearing stale mount");
            state.clear_mount();
            if let Some(loop_device) = persisted.loop_device {
                state.owe_detach(PendingDetach {
                    loop_device,
                    image_path: persisted.image_path,
                });
            }
            save_or_warn(state);
            self.sink.emit(Event::StaleMountCleared {
                mount_point: persisted.mount_point,
            });
            return None;
        };

        let kind = match (&persisted.loop_device, &persisted.mount_device) {
            (Some(loop_device), Some(device)) if loop_device != device => {
                DeviceKind::PartitionedImage
            }
            _ => DeviceKind::DirectFilesystem,
        };
        let session = MountSession {
            image: ImageReference::from_persisted(persisted.image_path),
            kind,
            loop_device: persisted.loop_device,
            device: entry.device,
            mount_point: entry.mount_point,
        };

        self.session = Some(session.clone());
        self.transition(MountState::Mounted);
        info!(mount_point = %session.mount_point.display(), "restored mount session");
        self.sink.emit(Event::SessionRestored {
            mount_point: session.mount_point.clone(),
        });
        Some(session)
    }

    /// Detaches loop devices an earlier unmount or run left attached.
    ///
    /// A device is only detached while it is still backed by the recorded
    /// image; a device that is gone or reused is forgotten. Failed detaches
    /// stay owed.
    fn detach_pending(&self, state: &mut PersistentState) {
        if state.pending_detach.is_empty() {
            return;
        }
        let udisks = Udisks::new(self.runner.as_ref(), &self.settings);
        let in_use = self
            .session
            .as_ref()
            .and_then(|session| session.loop_device.clone());

        for pending in std::mem::take(&mut state.pending_detach) {
            if in_use.as_ref() == Some(&pending.loop_device) {
                continue;
            }
            let device = pending.loop_device.display().to_string();
            match disk::backing_file(
                self.runner.as_ref(),
                &pending.loop_device,
                self.settings.command_timeout,
            ) {
                Ok(Some(file)) if file == pending.image_path => {
                    if detach_or_warn(&udisks, &pending.loop_device) {
                        info!(device = %device, "detached leftover loop device");
                    } else {
                        state.pending_detach.push(pending);
                    }
                }
                Ok(_) => debug!(device = %device, "loop device no longer backs the image, forgetting it"),
                Err(e) => {
                    warn!(device = %device, error = %e, "cannot inspect leftover loop device");
                    state.pending_detach.push(pending);
                }
            }
        }
        save_or_warn(state);
    }

    /// Unmounts the active session before teardown, if there is one, and
    /// retries owed loop detaches.
    pub fn failsafe_unmount(&mut self, state: &mut PersistentState) -> Result<()> {
        let result = if self.state == MountState::Mounted {
            self.request_unmount(state)
                .map(|_| ())
                .context(FailsafeUnmountSnafu)
        } else {
            Ok(())
        };
        self.detach_pending(state);
        result
    }

    fn transition(&mut self, to: MountState) {
        let from = std::mem::replace(&mut self.state, to.clone());
        debug!(%from, %to, "state change");
        self.sink.emit(Event::StateChanged { from, to });
    }

    fn fail(&mut self, operation: &str, error: &Error, resume: MountState) {
        warn!(operation, error = %error, "operation failed");
        self.transition(MountState::Failed(error.to_string()));
        self.sink.emit(Event::Failed {
            operation: operation.to_string(),
            message: error.to_string(),
        });
        self.transition(resume);
    }
}

/// Returns false if the loop device is still attached.
fn detach_or_warn(udisks: &Udisks<'_>, loop_device: &Path) -> bool {
    match udisks.loop_delete(loop_device) {
        Ok(()) => true,
        Err(e) => {
            warn!(device = %loop_device.display(), error = %e, "failed to detach loop device");
            false
        }
    }
}

fn save_or_warn(state: &PersistentState) {
    if let Err(e) = state.save() {
        warn!(error = %e, "failed to save state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::RecordingSink;
    use crate::permission::RULE_SCOPE;
    use crate::testing::{self, FakeRunner};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        runner: Arc<FakeRunner>,
        sink: Arc<RecordingSink>,
        controller: MountController,
        state: PersistentState,
        table: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let table = dir.path().join("mounts");
            fs::write(&table, "").unwrap();
            let runner = Arc::new(FakeRunner::new());
            let sink = Arc::new(RecordingSink::default());
            let controller =
                MountController::new(runner.clone(), Settings::default(), &table, sink.clone());
            let state = PersistentState::new(dir.path().join("config.json"));
            Self {
                dir,
                runner,
                sink,
                controller,
                state,
                table,
            }
        }

        fn image(&self, name: &str) -> ImageReference {
            ImageReference::new(testing::touch_image(self.dir.path(), name)).unwrap()
        }

        fn mount(&mut self, image: &ImageReference) -> Result<MountSession> {
            self.controller
                .request_mount(image, &granted(), &mut self.state)
        }
    }

    fn granted() -> PermissionRuleStatus {
        PermissionRuleStatus {
            installed: true,
            rule_path: PathBuf::from("/etc/polkit-1/rules.d/90-isomount.rules"),
            username: Some("alice".to_string()),
            scope: RULE_SCOPE,
        }
    }

    fn plain_disk(f: &Fixture) {
        testing::script_udisks(&f.runner, "/dev/loop0", "/run/media/alice/DISK");
        f.runner.respond(
            "lsblk",
            None,
            testing::ok(&testing::lsblk_plain("/dev/loop0", "iso9660")),
        );
    }

    #[test]
    fn test_mount_plain_image_records_mount_point() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let image = f.image("disk.iso");

        let session = f.mount(&image).unwrap();
        assert_eq!(session.kind, DeviceKind::DirectFilesystem);
        assert_eq!(session.device, PathBuf::from("/dev/loop0"));
        assert_eq!(session.mount_point, PathBuf::from("/run/media/alice/DISK"));
        assert_eq!(f.controller.state(), &MountState::Mounted);

        let saved = PersistentState::load(f.state.location()).unwrap();
        let persisted = saved.last_mount.unwrap();
        assert_eq!(persisted.mount_point, PathBuf::from("/run/media/alice/DISK"));
        assert_eq!(persisted.loop_device, Some(PathBuf::from("/dev/loop0")));

        let transitions: Vec<_> = f
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![MountState::Resolving, MountState::Mounting, MountState::Mounted]
        );
    }

    #[test]
    fn test_mount_then_unmount_returns_to_idle() {
        let mut f = Fixture::new();
        testing::script_udisks(&f.runner, "/dev/loop0", "/run/media/alice/Ubuntu");
        f.runner.respond(
            "lsblk",
            None,
            testing::ok(&testing::lsblk_isohybrid("/dev/loop0")),
        );
        let image = f.image("ubuntu.iso");

        f.mount(&image).unwrap();
        let released = f.controller.request_unmount(&mut f.state).unwrap();

        assert_eq!(released, PathBuf::from("/run/media/alice/Ubuntu"));
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert!(f.controller.session().is_none());
        assert!(f.state.last_mount.is_none());
        assert_eq!(
            f.runner.udisks_calls(),
            vec![
                format!(
                    "udisksctl loop-setup -r -f {} --no-user-interaction",
                    image.path().display()
                ),
                "udisksctl mount -b /dev/loop0p1 --options ro --no-user-interaction".to_string(),
                "udisksctl unmount -b /dev/loop0p1 --no-user-interaction".to_string(),
                "udisksctl loop-delete -b /dev/loop0 --no-user-interaction".to_string(),
            ]
        );
    }

    #[test]
    fn test_mount_while_mounted_is_session_busy() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let first = f.image("disk.iso");
        let second = f.image("other.iso");

        let session = f.mount(&first).unwrap();
        let calls_before = f.runner.udisks_calls().len();

        let err = f.mount(&second).unwrap_err();
        assert!(matches!(err, Error::SessionBusy { .. }));
        assert_eq!(f.controller.session(), Some(&session));
        assert_eq!(f.controller.state(), &MountState::Mounted);
        assert_eq!(f.runner.udisks_calls().len(), calls_before);
    }

    #[test]
    fn test_mount_without_permission_invokes_nothing() {
        let mut f = Fixture::new();
        let image = f.image("disk.iso");
        let denied = PermissionRuleStatus::not_installed("/etc/polkit-1/rules.d/90-isomount.rules");

        let err = f
            .controller
            .request_mount(&image, &denied, &mut f.state)
            .unwrap_err();
        assert!(matches!(err, Error::PermissionsNotConfigured));
        assert!(f.runner.calls().is_empty());
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn test_mount_failure_detaches_and_returns_to_idle() {
        let mut f = Fixture::new();
        plain_disk(&f);
        f.runner.respond(
            "udisksctl",
            Some("mount"),
            testing::fail(1, "Error mounting /dev/loop0: wrong fs type"),
        );
        let image = f.image("disk.iso");

        match f.mount(&image).unwrap_err() {
            Error::MountTool { stderr, .. } => {
                assert_eq!(stderr, "Error mounting /dev/loop0: wrong fs type");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert!(f.controller.session().is_none());
        assert!(f.state.last_mount.is_none());
        assert_eq!(f.runner.count("udisksctl", Some("loop-delete")), 1);
        assert!(
            f.sink
                .events()
                .iter()
                .any(|e| matches!(e, Event::Failed { operation, .. } if operation == "mount"))
        );
    }

    #[test]
    fn test_unreported_mount_point_uses_mount_table() {
        let mut f = Fixture::new();
        plain_disk(&f);
        f.runner
            .respond("udisksctl", Some("mount"), testing::ok("done\n"));
        fs::write(
            &f.table,
            "/dev/loop0 /run/media/alice/My\\040Disk iso9660 ro 0 0\n",
        )
        .unwrap();
        let image = f.image("disk.iso");

        let session = f.mount(&image).unwrap();
        assert_eq!(session.mount_point, PathBuf::from("/run/media/alice/My Disk"));
    }

    #[test]
    fn test_unknown_mount_point_rolls_back() {
        let mut f = Fixture::new();
        plain_disk(&f);
        f.runner
            .respond("udisksctl", Some("mount"), testing::ok(""));
        let image = f.image("disk.iso");

        assert!(matches!(
            f.mount(&image).unwrap_err(),
            Error::MountTool { .. }
        ));
        assert_eq!(f.runner.count("udisksctl", Some("unmount")), 1);
        assert_eq!(f.runner.count("udisksctl", Some("loop-delete")), 1);
        assert_eq!(f.controller.state(), &MountState::Idle);
    }

    #[test]
    fn test_unmount_failure_keeps_session() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let image = f.image("disk.iso");
        f.mount(&image).unwrap();
        fs::write(&f.table, "/dev/loop0 /run/media/alice/DISK iso9660 ro 0 0\n").unwrap();
        f.runner.respond(
            "udisksctl",
            Some("unmount"),
            testing::fail(1, "target is busy"),
        );

        let err = f.controller.request_unmount(&mut f.state).unwrap_err();
        assert!(matches!(err, Error::MountTool { .. }));
        assert_eq!(f.controller.state(), &MountState::Mounted);
        assert!(f.controller.session().is_some());
        assert!(f.state.last_mount.is_some());
        assert_eq!(f.runner.count("udisksctl", Some("loop-delete")), 0);
    }

    #[test]
    fn test_unmount_error_with_mount_gone_succeeds() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let image = f.image("disk.iso");
        f.mount(&image).unwrap();
        f.runner.respond(
            "udisksctl",
            Some("unmount"),
            testing::fail(1, "not mounted"),
        );

        f.controller.request_unmount(&mut f.state).unwrap();
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert_eq!(f.runner.count("udisksctl", Some("loop-delete")), 1);
    }

    #[test]
    fn test_unmount_when_idle() {
        let mut f = Fixture::new();
        assert!(matches!(
            f.controller.request_unmount(&mut f.state).unwrap_err(),
            Error::NoActiveSession
        ));
        assert!(f.runner.calls().is_empty());
    }

    #[test]
    fn test_reconcile_clears_stale_mount() {
        let mut f = Fixture::new();
        f.state.record_mount(PersistedMount {
            image_path: PathBuf::from("/home/alice/disk.iso"),
            mount_point: PathBuf::from("/run/media/alice/DISK"),
            loop_device: Some(PathBuf::from("/dev/loop0")),
            mount_device: Some(PathBuf::from("/dev/loop0")),
        });
        f.state.save().unwrap();
        f.runner.respond(
            "lsblk",
            Some("--nodeps"),
            testing::ok(&testing::lsblk_backing("/home/alice/disk.iso")),
        );

        let restored = f.controller.reconcile_on_startup(&mut f.state).unwrap();
        assert!(restored.is_none());
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert!(f.state.last_mount.is_none());
        assert!(f.state.pending_detach.is_empty());
        let saved = PersistentState::load(f.state.location()).unwrap();
        assert!(saved.last_mount.is_none());
        assert!(saved.pending_detach.is_empty());
        assert_eq!(
            f.runner.udisks_calls(),
            vec!["udisksctl loop-delete -b /dev/loop0 --no-user-interaction"]
        );
    }

    #[test]
    fn test_reconcile_leaves_reused_loop_device_alone() {
        let mut f = Fixture::new();
        f.state.record_mount(PersistedMount {
            image_path: PathBuf::from("/home/alice/disk.iso"),
            mount_point: PathBuf::from("/run/media/alice/DISK"),
            loop_device: Some(PathBuf::from("/dev/loop0")),
            mount_device: Some(PathBuf::from("/dev/loop0")),
        });
        f.runner.respond(
            "lsblk",
            Some("--nodeps"),
            testing::ok(&testing::lsblk_backing("/var/lib/snapd/snaps/core_1.snap")),
        );

        f.controller.reconcile_on_startup(&mut f.state).unwrap();
        assert!(f.state.last_mount.is_none());
        assert!(f.state.pending_detach.is_empty());
        assert!(f.runner.udisks_calls().is_empty());
    }

    #[test]
    fn test_failed_detach_is_retried_on_next_start() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let image = f.image("disk.iso");
        f.mount(&image).unwrap();
        f.runner.respond(
            "udisksctl",
            Some("loop-delete"),
            testing::fail(1, "device is busy"),
        );

        f.controller.request_unmount(&mut f.state).unwrap();
        assert_eq!(f.controller.state(), &MountState::Idle);
        assert!(f.state.last_mount.is_none());
        let owed = PendingDetach {
            loop_device: PathBuf::from("/dev/loop0"),
            image_path: image.path().to_path_buf(),
        };
        let saved = PersistentState::load(f.state.location()).unwrap();
        assert_eq!(saved.pending_detach, vec![owed]);

        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "lsblk",
            Some("--nodeps"),
            testing::ok(&testing::lsblk_backing(&image.path().display().to_string())),
        );
        let mut restarted = MountController::new(
            runner.clone(),
            Settings::default(),
            &f.table,
            Arc::new(RecordingSink::default()),
        );
        let mut state = saved;
        restarted.reconcile_on_startup(&mut state).unwrap();

        assert_eq!(runner.count("udisksctl", Some("loop-delete")), 1);
        assert!(state.pending_detach.is_empty());
        assert!(
            PersistentState::load(state.location())
                .unwrap()
                .pending_detach
                .is_empty()
        );
    }

    #[test]
    fn test_reconcile_restores_live_mount() {
        let mut f = Fixture::new();
        fs::write(
            &f.table,
            "/dev/loop3p1 /run/media/alice/Ubuntu\\04024.04 iso9660 ro 0 0\n",
        )
        .unwrap();
        f.state.record_mount(PersistedMount {
            image_path: PathBuf::from("/home/alice/ubuntu.iso"),
            mount_point: PathBuf::from("/run/media/alice/Ubuntu 24.04"),
            loop_device: Some(PathBuf::from("/dev/loop3")),
            mount_device: Some(PathBuf::from("/dev/loop3p1")),
        });

        let session = f
            .controller
            .reconcile_on_startup(&mut f.state)
            .unwrap()
            .unwrap();
        assert_eq!(session.kind, DeviceKind::PartitionedImage);
        assert_eq!(session.device, PathBuf::from("/dev/loop3p1"));
        assert_eq!(f.controller.state(), &MountState::Mounted);
        assert!(f.state.last_mount.is_some());
        assert!(f.runner.calls().is_empty());

        f.controller.request_unmount(&mut f.state).unwrap();
        assert_eq!(
            f.runner.udisks_calls(),
            vec![
                "udisksctl unmount -b /dev/loop3p1 --no-user-interaction",
                "udisksctl loop-delete -b /dev/loop3 --no-user-interaction",
            ]
        );
    }

    #[test]
    fn test_reconcile_requires_matching_device() {
        let mut f = Fixture::new();
        fs::write(&f.table, "/dev/sdb1 /run/media/alice/DISK vfat rw 0 0\n").unwrap();
        f.state.record_mount(PersistedMount {
            image_path: PathBuf::from("/home/alice/disk.iso"),
            mount_point: PathBuf::from("/run/media/alice/DISK"),
            loop_device: Some(PathBuf::from("/dev/loop0")),
            mount_device: Some(PathBuf::from("/dev/loop0")),
        });

        assert!(
            f.controller
                .reconcile_on_startup(&mut f.state)
                .unwrap()
                .is_none()
        );
        assert!(f.state.last_mount.is_none());
    }

    #[test]
    fn test_failsafe_unmount_wraps_error() {
        let mut f = Fixture::new();
        plain_disk(&f);
        let image = f.image("disk.iso");
        f.mount(&image).unwrap();
        fs::write(&f.table, "/dev/loop0 /run/media/alice/DISK iso9660 ro 0 0\n").unwrap();
        f.runner.respond(
            "udisksctl",
            Some("unmount"),
            testing::fail(1, "target is busy"),
        );

        let err = f.controller.failsafe_unmount(&mut f.state).unwrap_err();
        assert!(matches!(err, Error::FailsafeUnmount { .. }));
    }

    #[test]
    fn test_failsafe_unmount_is_noop_when_idle() {
        let mut f = Fixture::new();
        f.controller.failsafe_unmount(&mut f.state).unwrap();
        assert!(f.runner.calls().is_empty());
    }
}
