//! Scripted command runner for unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandRunner, CommandSpec, tool_hint};

type Handler = Box<dyn FnMut(&CommandSpec) -> Result<CommandOutput> + Send>;

struct Route {
    program: String,
    subcommand: Option<String>,
    handler: Handler,
}

/// A [`CommandRunner`] that answers from scripted handlers and records calls.
///
/// Later registrations win over earlier ones. Unscripted commands succeed
/// with empty output.
#[derive(Default)]
pub(crate) struct FakeRunner {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<CommandSpec>>,
    missing: Mutex<HashSet<String>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Routes `program [subcommand]` to `handler`.
    pub(crate) fn on<F>(&self, program: &str, subcommand: Option<&str>, handler: F)
    where
        F: FnMut(&CommandSpec) -> Result<CommandOutput> + Send + 'static,
    {
        self.routes.lock().unwrap().push(Route {
            program: program.to_string(),
            subcommand: subcommand.map(str::to_string),
            handler: Box::new(handler),
        });
    }

    /// Routes `program [subcommand]` to a fixed output.
    pub(crate) fn respond(&self, program: &str, subcommand: Option<&str>, output: CommandOutput) {
        self.on(program, subcommand, move |_| Ok(output.clone()));
    }

    /// Makes `program` look uninstalled.
    pub(crate) fn mark_missing(&self, program: &str) {
        self.missing.lock().unwrap().insert(program.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls to `program [subcommand]`.
    pub(crate) fn count(&self, program: &str, subcommand: Option<&str>) -> usize {
        self.calls()
            .iter()
            .filter(|spec| matches(spec, program, subcommand))
            .count()
    }

    /// Udisks calls only, as display strings.
    pub(crate) fn udisks_calls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|spec| spec.program() == "udisksctl")
            .map(CommandSpec::display)
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        if self.missing.lock().unwrap().contains(spec.program()) {
            return Err(Error::ToolNotFound {
                tool: spec.program().to_string(),
                hint: tool_hint(spec.program()),
            });
        }

        let mut routes = self.routes.lock().unwrap();
        match routes
            .iter_mut()
            .rev()
            .find(|route| matches(spec, &route.program, route.subcommand.as_deref()))
        {
            Some(route) => (route.handler)(spec),
            None => Ok(ok("")),
        }
    }

    fn is_available(&self, program: &str) -> bool {
        !self.missing.lock().unwrap().contains(program)
    }
}

fn matches(spec: &CommandSpec, program: &str, subcommand: Option<&str>) -> bool {
    spec.program() == program
        && subcommand.is_none_or(|sub| spec.arguments().first().map(String::as_str) == Some(sub))
}

/// Successful output with `stdout`.
pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Failed output with `code` and `stderr`.
pub(crate) fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// lsblk JSON for a loop device without a partition table.
pub(crate) fn lsblk_plain(loop_dev: &str, fstype: &str) -> String {
    format!(
        r#"{{"blockdevices": [{{"name": "{loop_dev}", "type": "loop", "fstype": "{fstype}", "pttype": null}}]}}"#
    )
}

/// lsblk JSON for an isohybrid image: iso9660 partition, EFI partition, empty slot.
pub(crate) fn lsblk_isohybrid(loop_dev: &str) -> String {
    format!(
        r#"{{
  "blockdevices": [
    {{
      "name": "{loop_dev}", "type": "loop", "fstype": "iso9660", "pttype": "dos",
      "children": [
        {{"name": "{loop_dev}p1", "type": "part", "fstype": "iso9660", "pttype": "dos"}},
        {{"name": "{loop_dev}p2", "type": "part", "fstype": "vfat", "pttype": "dos"}},
        {{"name": "{loop_dev}p3", "type": "part", "fstype": null, "pttype": "dos"}}
      ]
    }}
  ]
}}"#
    )
}

/// lsblk JSON for the backing file of a loop device.
pub(crate) fn lsblk_backing(file: &str) -> String {
    format!(r#"{{"blockdevices": [{{"back-file": "{file}"}}]}}"#)
}

/// Scripts a healthy udisks: loop-setup, mount, unmount and loop-delete succeed.
pub(crate) fn script_udisks(runner: &FakeRunner, loop_dev: &str, mount_point: &str) {
    let mapped = format!("Mapped file /images/disk.iso as {loop_dev}.\n");
    runner.respond("udisksctl", Some("loop-setup"), ok(&mapped));

    let mount_point = mount_point.to_string();
    runner.on("udisksctl", Some("mount"), move |spec| {
        let device = spec.arguments().get(2).cloned().unwrap_or_default();
        Ok(ok(&format!("Mounted {device} at {mount_point}\n")))
    });
    runner.respond("udisksctl", Some("unmount"), ok(""));
    runner.respond("udisksctl", Some("loop-delete"), ok(""));
}

/// Creates an empty `.iso` file in `dir`.
pub(crate) fn touch_image(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"CD001").unwrap();
    path
}
