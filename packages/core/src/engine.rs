//! Single owner of the controller, managers and persisted state.
//!
//! Frontends talk to an [`Engine`] (directly, or through the worker in
//! [`crate::service`]) using named operations only.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Layout, Settings};
use crate::controller::{MountController, MountSession, MountState};
use crate::error::Result;
use crate::event::{Event, EventSink};
use crate::executor::{CommandRunner, ExecutionContext};
use crate::image::ImageReference;
use crate::install::{InstallationManager, UninstallReport};
use crate::permission::{FixOutcome, PermissionManager, PermissionRuleStatus};
use crate::state::{InstalledArtifact, PersistentState};

/// Snapshot of everything a frontend renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: MountState,
    pub session: Option<MountSession>,
    pub permission: PermissionRuleStatus,
    pub installed: bool,
    pub autostart: bool,
    pub last_image: Option<PathBuf>,
    pub artifacts: Vec<InstalledArtifact>,
}

pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    layout: Layout,
    settings: Settings,
    sink: Arc<dyn EventSink>,
    controller: MountController,
    state: PersistentState,
    source_binary: Option<PathBuf>,
    username: Option<String>,
}

impl Engine {
    /// Creates an engine that runs real commands.
    pub fn new(layout: Layout, settings: Settings, sink: Arc<dyn EventSink>) -> Result<Self> {
        let runner = ExecutionContext::with_escalation(settings.escalation)
            .with_default_timeout(settings.command_timeout);
        Self::with_runner(Arc::new(runner), layout, settings, sink)
    }

    /// Creates an engine on top of a custom runner.
    pub fn with_runner(
        runner: Arc<dyn CommandRunner>,
        layout: Layout,
        settings: Settings,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let state = PersistentState::load(&layout.state_file)?;
        let controller = MountController::new(
            Arc::clone(&runner),
            settings.clone(),
            &layout.mount_table,
            Arc::clone(&sink),
        );
        Ok(Self {
            runner,
            layout,
            settings,
            sink,
            controller,
            state,
            source_binary: None,
            username: None,
        })
    }

    /// Installs `path` instead of the running executable.
    pub fn with_source_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_binary = Some(path.into());
        self
    }

    /// Writes permission rules for `username` instead of the invoking user.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn persistent_state(&self) -> &PersistentState {
        &self.state
    }

    pub fn mount_state(&self) -> &MountState {
        self.controller.state()
    }

    /// Adopts or forgets the mount recorded by a previous run.
    pub fn startup(&mut self) -> Result<Option<MountSession>> {
        self.controller.reconcile_on_startup(&mut self.state)
    }

    pub fn permission_status(&self) -> PermissionRuleStatus {
        self.permissions().status(&self.state)
    }

    /// Mounts the image at `path`.
    pub fn mount(&mut self, path: &Path) -> Result<MountSession> {
        let image = ImageReference::new(path)?;
        let permission = self.permission_status();
        self.controller
            .request_mount(&image, &permission, &mut self.state)
    }

    pub fn unmount(&mut self) -> Result<PathBuf> {
        self.controller.request_unmount(&mut self.state)
    }

    pub fn fix_permissions(&mut self) -> Result<FixOutcome> {
        let permissions = permission_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.username.as_deref(),
        );
        let outcome = permissions.fix(&mut self.state);
        let outcome = self.report("fix-permissions", outcome)?;
        if outcome == FixOutcome::Installed {
            self.sink.emit(Event::PermissionsInstalled {
                rule_path: self.layout.polkit_rule.clone(),
            });
        }
        Ok(outcome)
    }

    pub fn install(&mut self, autostart: bool) -> Result<Vec<PathBuf>> {
        let installer = installation_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.source_binary.as_deref(),
        );
        let written = installer.install(&mut self.state, autostart);
        let written = self.report("install", written)?;
        self.sink.emit(Event::Installed {
            artifacts: written.clone(),
        });
        Ok(written)
    }

    /// Tears everything down and asks the frontend to exit.
    pub fn uninstall(&mut self) -> Result<UninstallReport> {
        let installer = installation_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.source_binary.as_deref(),
        );
        let permissions = permission_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.username.as_deref(),
        );
        let report = installer.uninstall(&mut self.controller, &permissions, &mut self.state);
        let report = self.report("uninstall", report)?;

        if let Some(error) = &report.failsafe_error {
            warn!(error = %error, "uninstalled with an active mount left behind");
        }
        self.sink.emit(Event::Uninstalled);
        self.sink.emit(Event::TerminationRequested);
        Ok(report)
    }

    pub fn set_autostart(&mut self, enabled: bool) -> Result<()> {
        let installer = installation_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.source_binary.as_deref(),
        );
        let result = installer.toggle_autostart(&mut self.state, enabled);
        self.report("autostart", result)
    }

    pub fn is_installed(&self) -> bool {
        self.installer().is_installed(&self.state)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.controller.state().clone(),
            session: self.controller.session().cloned(),
            permission: self.permission_status(),
            installed: self.is_installed(),
            autostart: self.state.autostart,
            last_image: self.state.last_image.clone(),
            artifacts: self.state.artifacts.iter().cloned().collect(),
        }
    }

    fn permissions(&self) -> PermissionManager<'_> {
        permission_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.username.as_deref(),
        )
    }

    fn installer(&self) -> InstallationManager<'_> {
        installation_manager(
            self.runner.as_ref(),
            &self.layout,
            &self.settings,
            self.source_binary.as_deref(),
        )
    }

    /// Publishes a failure event for `operation` and passes the result on.
    fn report<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => info!(operation, "operation complete"),
            Err(e) => self.sink.emit(Event::Failed {
                operation: operation.to_string(),
                message: e.to_string(),
            }),
        }
        result
    }
}

fn permission_manager<'a>(
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    settings: &'a Settings,
    username: Option<&str>,
) -> PermissionManager<'a> {
    let manager = PermissionManager::new(runner, layout, settings);
    match username {
        Some(name) => manager.with_username(name),
        None => manager,
    }
}

fn installation_manager<'a>(
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    settings: &'a Settings,
    source_binary: Option<&Path>,
) -> InstallationManager<'a> {
    let manager = InstallationManager::new(runner, layout, settings);
    match source_binary {
        Some(path) => manager.with_source_binary(path),
        None => manager,
    }
}
