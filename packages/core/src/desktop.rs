//! Desktop environment refresh helpers.
//!
//! All of these are optional niceties: missing tools are skipped and
//! failures never reach the caller.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::executor::{CommandRunner, CommandSpec, run_best_effort};

/// Asks menu caches to pick up added or removed desktop entries.
pub fn refresh_menus(runner: &dyn CommandRunner, applications_dir: &Path, timeout: Duration) {
    let helpers = [
        CommandSpec::new("update-desktop-database").arg(applications_dir.display().to_string()),
        CommandSpec::new("xdg-desktop-menu").arg("forceupdate"),
    ];
    let refreshed = helpers
        .into_iter()
        .filter(|spec| run_best_effort(runner, &spec.clone().timeout(timeout)))
        .count();

    // KDE keeps its own cache; one sycoca rebuild is enough.
    let kde = ["kbuildsycoca6", "kbuildsycoca5"]
        .into_iter()
        .any(|tool| run_best_effort(runner, &CommandSpec::new(tool).timeout(timeout)));

    debug!(refreshed, kde, "menu refresh done");
}

/// Asks a running file manager to re-read its view of mounted volumes.
pub fn refresh_file_manager(runner: &dyn CommandRunner, timeout: Duration) {
    for tool in ["kioclient6", "kioclient5"] {
        let spec = CommandSpec::new(tool).args(["refresh", "/"]).timeout(timeout);
        if run_best_effort(runner, &spec) {
            break;
        }
    }
}
