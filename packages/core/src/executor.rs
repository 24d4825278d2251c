//! Command execution abstraction with privilege escalation support.
//!
//! Every external tool goes through [`CommandRunner`]: argument arrays only
//! (never a shell), captured stdout/stderr, and an optional timeout. A
//! non-zero exit is *not* an error here; callers decide what a failure means.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Exit code pkexec uses when the authentication dialog was dismissed.
pub const PKEXEC_DISMISSED: i32 = 126;

/// Exit code pkexec uses when authorization was refused.
pub const PKEXEC_NOT_AUTHORIZED: i32 = 127;

/// Grace period between SIGTERM and SIGKILL for timed-out commands.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How often a running child is polled while a timeout is armed.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for output pipes to close once the child has exited.
/// A daemonized grandchild can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    /// Name of the wrapper program, if any.
    pub fn wrapper(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    privileged: bool,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            privileged: false,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kills the command if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Routes the command through the privilege escalation tool.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns true if a pkexec prompt was dismissed or refused.
    pub fn auth_rejected(&self) -> bool {
        self.exit_code == PKEXEC_DISMISSED || self.exit_code == PKEXEC_NOT_AUTHORIZED
    }

    /// The most useful diagnostic text: stderr if present, else stdout.
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// Converts a non-zero exit into [`Error::CommandExit`].
    pub fn checked(self, command: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::CommandExit {
            command: command.display(),
            code: self.exit_code,
            stderr: self.message().to_string(),
        })
    }
}

/// Executes external commands.
///
/// Implementations must be usable from the worker thread, hence `Send + Sync`.
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion (or until its timeout fires).
    ///
    /// Fails only when the command could not be launched, the tool is
    /// missing, or the timeout expired.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Returns true if `program` can be found on `PATH`.
    fn is_available(&self, program: &str) -> bool;
}

/// Execution context for running system commands.
///
/// Holds how privileged commands are escalated and the timeout applied to
/// specs that do not carry their own.
///
/// # Example
///
/// ```
/// use isomount_core::executor::{ExecutionContext, PrivilegeEscalation};
///
/// let ctx = ExecutionContext::with_pkexec();
/// assert_eq!(ctx.escalation(), PrivilegeEscalation::Pkexec);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
    default_timeout: Option<Duration>,
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self::with_escalation(PrivilegeEscalation::Pkexec)
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self::with_escalation(PrivilegeEscalation::Sudo)
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self {
            escalation,
            default_timeout: None,
        }
    }

    /// Applies `timeout` to every spec that has none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Builds the process for `spec`, resolving tools to absolute paths.
    fn build(&self, spec: &CommandSpec) -> Result<Command> {
        let program = locate(spec.program())?;

        let wrapper = if spec.is_privileged() {
            self.escalation.wrapper().map(locate).transpose()?
        } else {
            None
        };

        let mut command = match wrapper {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(program);
                command
            }
            None => {
                let mut command = Command::new(program);
                // Keep tool output parseable.
                command.env("LC_ALL", "C");
                command
            }
        };

        command
            .args(spec.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

impl CommandRunner for ExecutionContext {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = self.build(spec)?;
        let timeout = spec.timeout_value().or(self.default_timeout);

        debug!(
            command = %spec.display(),
            privileged = spec.is_privileged(),
            "running command"
        );

        let mut child = command.spawn().command_context(spec.display())?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match timeout {
            Some(timeout) => match wait_for(&mut child, timeout).command_context(spec.display())? {
                Some(status) => status,
                None => {
                    terminate(&mut child);
                    warn!(command = %spec.display(), "command timed out");
                    return Err(Error::CommandTimeout {
                        command: spec.display(),
                        timeout,
                    });
                }
            },
            None => child.wait().command_context(spec.display())?,
        };

        let output = CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        debug!(command = %spec.display(), exit_code = output.exit_code, "command finished");
        Ok(output)
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Runs an optional helper; returns true only if it ran and exited 0.
///
/// Missing tools are skipped silently, failures are logged at debug level.
pub fn run_best_effort(runner: &dyn CommandRunner, spec: &CommandSpec) -> bool {
    if !runner.is_available(spec.program()) {
        debug!(program = spec.program(), "helper not installed, skipping");
        return false;
    }
    match runner.run(spec) {
        Ok(output) if output.success() => true,
        Ok(output) => {
            debug!(command = %spec.display(), error = output.message(), "helper failed");
            false
        }
        Err(e) => {
            debug!(command = %spec.display(), error = %e, "helper failed");
            false
        }
    }
}

/// Resolves a program on `PATH`, mapping absence to [`Error::ToolNotFound`].
fn locate(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|_| Error::ToolNotFound {
        tool: program.to_string(),
        hint: tool_hint(program),
    })
}

/// Remediation hint for a missing tool.
pub fn tool_hint(program: &str) -> String {
    let package = match program {
        "udisksctl" => "udisks2",
        "lsblk" | "blockdev" => "util-linux",
        "partprobe" => "parted",
        "udevadm" => "systemd-udev",
        "pkexec" => "polkit",
        "sudo" => "sudo",
        "install" | "rm" => "coreutils",
        _ => return format!("install '{program}' and make sure it is on PATH"),
    };
    format!("install the '{package}' package")
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<mpsc::Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    })
}

/// Waits at most [`DRAIN_GRACE`] for a pipe. On expiry the reader thread is
/// left behind and the output is dropped.
fn collect(pipe: Option<mpsc::Receiver<Vec<u8>>>) -> String {
    match pipe.map(|rx| rx.recv_timeout(DRAIN_GRACE)) {
        Some(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        Some(Err(_)) => {
            debug!("output pipe still open after exit, dropping output");
            String::new()
        }
        None => String::new(),
    }
}

/// Polls `child` until it exits or `timeout` elapses.
fn wait_for(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Asks a timed-out child to exit, then kills it.
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if kill(pid, Signal::SIGTERM).is_ok() && matches!(wait_for(child, KILL_GRACE), Ok(Some(_))) {
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context() {
        let ctx = ExecutionContext::default();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
    }

    #[test]
    fn test_pkexec_context() {
        let ctx = ExecutionContext::with_pkexec();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Pkexec);
        assert_eq!(ctx.escalation().wrapper(), Some("pkexec"));
    }

    #[test]
    fn test_sudo_context() {
        let ctx = ExecutionContext::with_sudo();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Sudo);
    }

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("udisksctl")
            .args(["loop-setup", "-r", "-f"])
            .arg("/tmp/disk.iso");
        assert_eq!(spec.display(), "udisksctl loop-setup -r -f /tmp/disk.iso");
        assert!(!spec.is_privileged());
        assert!(spec.clone().privileged().is_privileged());
    }

    #[test]
    fn test_output_message_prefers_stderr() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "ignored\n".to_string(),
            stderr: "  Error: boom \n".to_string(),
        };
        assert_eq!(output.message(), "Error: boom");

        let output = CommandOutput {
            exit_code: 1,
            stdout: "only stdout\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.message(), "only stdout");
    }

    #[test]
    fn test_checked_maps_exit_code() {
        let spec = CommandSpec::new("lsblk");
        let err = CommandOutput {
            exit_code: 32,
            stdout: String::new(),
            stderr: "not a block device".to_string(),
        }
        .checked(&spec)
        .unwrap_err();
        assert!(matches!(err, Error::CommandExit { code: 32, .. }));
    }

    #[test]
    fn test_run_captures_output_and_exit_code() {
        let ctx = ExecutionContext::new();
        let spec = CommandSpec::new("sh").args(["-c", "printf out; printf err >&2; exit 3"]);
        let output = ctx.run(&spec).unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[test]
    fn test_run_times_out() {
        let ctx = ExecutionContext::new();
        let spec = CommandSpec::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100));
        let err = ctx.run(&spec).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[test]
    fn test_run_returns_when_grandchild_holds_stdout() {
        let ctx = ExecutionContext::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 30 & exit 0"])
            .timeout(Duration::from_secs(10));

        let started = Instant::now();
        let output = ctx.run(&spec).unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_tool() {
        let ctx = ExecutionContext::new();
        let err = ctx
            .run(&CommandSpec::new("isomount-definitely-not-a-tool"))
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
        assert!(!ctx.is_available("isomount-definitely-not-a-tool"));
    }

    #[test]
    fn test_tool_hint() {
        assert_eq!(tool_hint("udisksctl"), "install the 'udisks2' package");
        assert!(tool_hint("frobnicate").contains("frobnicate"));
    }
}
