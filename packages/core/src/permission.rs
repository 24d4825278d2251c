//! Polkit rule management.
//!
//! A single rule file grants the invoking user the udisks actions needed
//! for loop setup, mount, unmount and loop teardown, limited to local
//! active sessions. Once it is installed every udisks call runs
//! unprivileged and without prompts.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{APP_ID, Layout, Settings};
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{CommandOutput, CommandRunner, CommandSpec};
use crate::state::PersistentState;

/// First line of every rule we generate.
pub const RULE_MARKER: &str = "// Managed by isomount";

/// File mode the installed rule must have.
pub const RULE_MODE: u32 = 0o644;

/// Session scope the rule is restricted to.
pub const RULE_SCOPE: &str = "local-active";

/// Observed state of the permission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRuleStatus {
    pub installed: bool,
    pub rule_path: PathBuf,
    pub username: Option<String>,
    pub scope: &'static str,
}

impl PermissionRuleStatus {
    /// Status reporting a missing rule.
    pub fn not_installed(rule_path: impl Into<PathBuf>) -> Self {
        Self {
            installed: false,
            rule_path: rule_path.into(),
            username: None,
            scope: RULE_SCOPE,
        }
    }
}

/// What [`PermissionManager::fix`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Installed,
    AlreadyConfigured,
}

/// Returns the login name of the invoking user.
pub fn current_username() -> Result<String> {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(Error::UserLookup {
            message: format!("no passwd entry for uid {uid}"),
        }),
        Err(e) => Err(Error::UserLookup {
            message: e.to_string(),
        }),
    }
}

/// Rejects names that could break out of the rule's string literal.
pub fn validate_username(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidUsername {
            name: name.to_string(),
        })
    }
}

/// Generates the rule text for `username`.
pub fn rule_text(username: &str) -> String {
    format!(
        r#"{RULE_MARKER}; remove with `{APP_ID} uninstall`.
polkit.addRule(function(action, subject) {{
  if (subject.user != "{username}" || !subject.local || !subject.active) {{
    return polkit.Result.NOT_HANDLED;
  }}
  if (action.id.indexOf("org.freedesktop.udisks2.filesystem-mount") === 0 ||
      action.id === "org.freedesktop.udisks2.filesystem-unmount-others" ||
      action.id === "org.freedesktop.udisks2.loop-setup" ||
      action.id === "org.freedesktop.udisks2.loop-delete-others" ||
      action.id === "org.freedesktop.udisks2.loop-modify-others") {{
    return polkit.Result.YES;
  }}
  return polkit.Result.NOT_HANDLED;
}});
"#
    )
}

/// Installs, detects and removes the polkit rule.
pub struct PermissionManager<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    settings: &'a Settings,
    username: Option<String>,
}

impl<'a> PermissionManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: &'a Layout, settings: &'a Settings) -> Self {
        Self {
            runner,
            layout,
            settings,
            username: None,
        }
    }

    /// Uses `username` instead of looking up the invoking user.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    fn rule_path(&self) -> &Path {
        &self.layout.polkit_rule
    }

    /// Checks whether the rule file exists.
    ///
    /// When the rule directory cannot be probed, the persisted flag decides.
    pub fn status(&self, state: &PersistentState) -> PermissionRuleStatus {
        let installed = match fs::metadata(self.rule_path()) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %self.rule_path().display(), "cannot probe rule, using saved flag");
                state.permission.installed
            }
            Err(_) => false,
        };

        PermissionRuleStatus {
            installed,
            rule_path: self.rule_path().to_path_buf(),
            username: installed
                .then(|| state.permission.username.clone())
                .flatten(),
            scope: RULE_SCOPE,
        }
    }

    /// Generates and installs the rule for the current user.
    ///
    /// Each call is a single attempt; a cancelled or denied prompt leaves
    /// the status unchanged.
    pub fn fix(&self, state: &mut PersistentState) -> Result<FixOutcome> {
        if self.status(state).installed {
            info!(path = %self.rule_path().display(), "permission rule already present");
            return Ok(FixOutcome::AlreadyConfigured);
        }

        let username = match &self.username {
            Some(name) => name.clone(),
            None => current_username()?,
        };
        validate_username(&username)?;

        let staged = self.layout.staged_rule();
        self.stage(&staged, &rule_text(&username))?;

        let result = self.install_staged(&staged).and_then(|()| self.verify());
        if let Err(e) = fs::remove_file(&staged) {
            warn!(path = %staged.display(), error = %e, "failed to remove staged rule");
        }
        result?;

        state.permission.installed = true;
        state.permission.username = Some(username.clone());
        if let Err(e) = state.save() {
            warn!(error = %e, "rule installed but state could not be saved");
        }

        info!(user = %username, path = %self.rule_path().display(), "permission rule installed");
        Ok(FixOutcome::Installed)
    }

    /// Deletes the rule with a privileged `rm`.
    pub fn remove(&self, state: &mut PersistentState) -> Result<()> {
        let rule = self.rule_path();
        let present = match fs::symlink_metadata(rule) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => state.permission.installed,
            Err(_) => false,
        };

        if present {
            let spec = CommandSpec::new("rm")
                .arg("-f")
                .arg(rule.display().to_string())
                .privileged()
                .timeout(self.settings.privileged_timeout);
            let output = self.runner.run(&spec).map_err(|e| self.write_error(e))?;
            if !output.success() {
                return Err(Error::PermissionRuleWrite {
                    path: rule.to_path_buf(),
                    message: rejection_message(&output),
                });
            }
            info!(path = %rule.display(), "permission rule removed");
        }

        state.permission = Default::default();
        Ok(())
    }

    fn stage(&self, staged: &Path, text: &str) -> Result<()> {
        if let Some(dir) = staged.parent() {
            fs::create_dir_all(dir).artifact_context(dir)?;
        }
        fs::write(staged, text).artifact_context(staged)
    }

    fn install_staged(&self, staged: &Path) -> Result<()> {
        let rule = self.rule_path();

        let wrapper = self.settings.escalation.wrapper();
        if let Some(wrapper) = wrapper.filter(|w| !self.runner.is_available(w)) {
            return Err(Error::ToolNotFound {
                tool: wrapper.to_string(),
                hint: format!(
                    "run as root: install -m 0644 {} {}",
                    staged.display(),
                    rule.display()
                ),
            });
        }

        let spec = CommandSpec::new("install")
            .args(["-m", "0644"])
            .arg(staged.display().to_string())
            .arg(rule.display().to_string())
            .privileged()
            .timeout(self.settings.privileged_timeout);

        let output = self.runner.run(&spec).map_err(|e| self.write_error(e))?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::PermissionRuleWrite {
                path: rule.to_path_buf(),
                message: rejection_message(&output),
            })
        }
    }

    /// Checks that the rule exists with mode 0644.
    fn verify(&self) -> Result<()> {
        let rule = self.rule_path();
        let verify_error = |message: String| Error::PermissionRuleVerify {
            path: rule.to_path_buf(),
            message,
        };

        match fs::metadata(rule) {
            Ok(meta) => {
                let mode = meta.permissions().mode() & 0o777;
                if mode == RULE_MODE {
                    Ok(())
                } else {
                    Err(verify_error(format!("unexpected mode {mode:o}")))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %rule.display(), "rule directory not readable, skipping verification");
                Ok(())
            }
            Err(e) => Err(verify_error(e.to_string())),
        }
    }

    /// Missing tools keep their hint; everything else is a write failure.
    fn write_error(&self, err: Error) -> Error {
        match err {
            Error::ToolNotFound { .. } => err,
            other => Error::PermissionRuleWrite {
                path: self.rule_path().to_path_buf(),
                message: other.to_string(),
            },
        }
    }
}

fn rejection_message(output: &CommandOutput) -> String {
    if output.auth_rejected() {
        "authentication was cancelled or denied".to_string()
    } else if output.message().is_empty() {
        format!("exited with code {}", output.exit_code)
    } else {
        output.message().to_string()
    }
}
