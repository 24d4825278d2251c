//! ISO Mount CLI - Command line frontend for the mount engine.
//!
//! Every invocation loads the saved state, reconciles it with the mount
//! table, runs one command on the worker and prints the outcome.

mod logging;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use isomount_core::error::Result;
use isomount_core::install::UninstallReport;
use isomount_core::{
    Engine, Error, Event, FixOutcome, Layout, PrivilegeEscalation, Request, Response, Service,
    Settings, StatusReport,
};
use tracing::debug;

/// Mount ISO images without repeated password prompts.
#[derive(Parser, Debug)]
#[command(name = "isomount", version)]
#[command(about = "Mount and unmount ISO images through udisks", long_about = None)]
struct Cli {
    /// Use sudo instead of pkexec for privileged steps.
    #[arg(long, global = true)]
    sudo: bool,

    /// Timeout in seconds for external tools.
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show mount, permission and installation status.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Mount an ISO image read-only.
    Mount {
        /// Path to the .iso file. Defaults to the last mounted image.
        image: Option<PathBuf>,
    },
    /// Unmount the active image and detach its loop device.
    Unmount,
    /// Install the polkit rule so mounting needs no password.
    FixPermissions,
    /// Install the executable and desktop entries for this user.
    Install {
        /// Also start on login.
        #[arg(long)]
        autostart: bool,
    },
    /// Remove everything that install and fix-permissions created.
    Uninstall {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
    /// Enable or disable the autostart entry.
    Autostart {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Toggle {
    On,
    Off,
}

impl Commands {
    fn into_request(self, last_image: Option<PathBuf>) -> Result<Request> {
        let request = match self {
            Commands::Status { .. } => Request::Status,
            Commands::Mount { image } => Request::Mount {
                image: image.or(last_image).ok_or_else(|| Error::Generic {
                    message: "no image given and none was mounted before".to_string(),
                    source: None,
                })?,
            },
            Commands::Unmount => Request::Unmount,
            Commands::FixPermissions => Request::FixPermissions,
            Commands::Install { autostart } => Request::Install { autostart },
            Commands::Uninstall { .. } => Request::Uninstall,
            Commands::Autostart { state } => Request::SetAutostart {
                enabled: state == Toggle::On,
            },
        };
        Ok(request)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn settings_from(cli: &Cli) -> Settings {
    let escalation = if cli.sudo {
        PrivilegeEscalation::Sudo
    } else {
        PrivilegeEscalation::Pkexec
    };
    let settings = Settings::new().with_escalation(escalation);
    match cli.timeout {
        Some(secs) => settings.with_command_timeout(Duration::from_secs(secs)),
        None => settings,
    }
}

fn run(cli: Cli) -> Result<()> {
    let needs_confirmation = matches!(cli.command, Commands::Uninstall { yes: false });
    if needs_confirmation
        && !confirm("Remove isomount, its desktop entries and the permission rule?")
    {
        println!("Aborted.");
        return Ok(());
    }

    let settings = settings_from(&cli);
    let layout = Layout::for_current_user()?;
    debug!(state_file = %layout.state_file.display(), escalation = ?settings.escalation, "starting");
    let (events, inbox) = mpsc::channel::<Event>();
    let verbose = cli.verbose > 0;
    let printer = thread::spawn(move || {
        for event in inbox {
            print_event(&event, verbose);
        }
    });

    let mut engine = Engine::new(layout, settings, Arc::new(events))?;
    engine.startup()?;

    let json = matches!(cli.command, Commands::Status { json: true });
    let request = cli
        .command
        .into_request(engine.persistent_state().last_image.clone())?;
    let service = Service::spawn(engine)?;
    let result = service.call(request);

    // Dropping the service drops the engine and with it the last sender.
    drop(service);
    let _ = printer.join();

    render(result?, json)
}

fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
}

fn print_event(event: &Event, verbose: bool) {
    match event {
        Event::StateChanged { from, to } if verbose => eprintln!("state: {from} -> {to}"),
        Event::SessionRestored { mount_point } => {
            eprintln!("Restored mount at {}", mount_point.display())
        }
        Event::StaleMountCleared { mount_point } => {
            eprintln!("Forgot stale mount at {}", mount_point.display())
        }
        _ => {}
    }
}

fn render(response: Response, json: bool) -> Result<()> {
    match response {
        Response::Status(report) if json => {
            let text = serde_json::to_string_pretty(&report)
                .map_err(|source| Error::StateSerialize { source })?;
            println!("{text}");
        }
        Response::Status(report) => print!("{}", format_status(&report)),
        Response::Mounted(session) => println!(
            "Mounted {} at {}",
            session.image.file_name(),
            session.mount_point.display()
        ),
        Response::Unmounted { mount_point } => {
            println!("Unmounted {}", mount_point.display())
        }
        Response::Permissions(FixOutcome::Installed) => {
            println!("Permission rule installed; mounting no longer needs a password.")
        }
        Response::Permissions(FixOutcome::AlreadyConfigured) => {
            println!("Permissions are already configured.")
        }
        Response::Installed(paths) => {
            println!("Installed:");
            for path in paths {
                println!("  {}", path.display());
            }
        }
        Response::Uninstalled(report) => print!("{}", format_uninstall(&report)),
        Response::AutostartChanged { enabled } => {
            println!("Autostart {}.", if enabled { "enabled" } else { "disabled" })
        }
    }
    Ok(())
}

fn format_status(report: &StatusReport) -> String {
    let mut out = format!("state:        {}\n", report.state);
    if let Some(session) = &report.session {
        out.push_str(&format!("image:        {}\n", session.image.path().display()));
        out.push_str(&format!("device:       {}\n", session.device.display()));
        out.push_str(&format!("mount point:  {}\n", session.mount_point.display()));
    } else if let Some(last) = &report.last_image {
        out.push_str(&format!("last image:   {}\n", last.display()));
    }

    let permission = if report.permission.installed {
        format!("configured ({})", report.permission.rule_path.display())
    } else {
        "not configured (run 'isomount fix-permissions')".to_string()
    };
    out.push_str(&format!("permissions:  {permission}\n"));
    out.push_str(&format!(
        "installed:    {}\n",
        if report.installed { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "autostart:    {}\n",
        if report.autostart { "on" } else { "off" }
    ));
    out
}

fn format_uninstall(report: &UninstallReport) -> String {
    let mut out = format!("Removed {} file(s).\n", report.removed.len());
    if let Some(error) = &report.failsafe_error {
        out.push_str(&format!(
            "Warning: the active image could not be unmounted: {error}\n"
        ));
    }
    out
}

fn report_error(error: &Error) {
    eprintln!("error: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    if let Some(hint) = error.hint() {
        eprintln!("hint: {hint}");
    }
}
