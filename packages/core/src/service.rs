//! Worker thread that owns the [`Engine`].
//!
//! External commands block, so frontends hand requests to a dedicated
//! thread and keep their own loop responsive. Only one request may be in
//! flight; a second one is rejected with [`Error::SessionBusy`] instead of
//! being queued.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::MountSession;
use crate::engine::{Engine, StatusReport};
use crate::error::{Error, Result};
use crate::install::UninstallReport;
use crate::permission::FixOutcome;

/// Operation requested by a frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Status,
    Mount { image: PathBuf },
    Unmount,
    FixPermissions,
    Install { autostart: bool },
    Uninstall,
    SetAutostart { enabled: bool },
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Status(Box<StatusReport>),
    Mounted(MountSession),
    Unmounted { mount_point: PathBuf },
    Permissions(FixOutcome),
    Installed(Vec<PathBuf>),
    Uninstalled(UninstallReport),
    AutostartChanged { enabled: bool },
}

/// Reply sent back for every request.
pub type Reply = Result<Response>;

/// Runs one request against the engine.
pub fn dispatch(engine: &mut Engine, request: Request) -> Reply {
    debug!(?request, "handling request");
    match request {
        Request::Status => Ok(Response::Status(Box::new(engine.status()))),
        Request::Mount { image } => engine.mount(&image).map(Response::Mounted),
        Request::Unmount => engine
            .unmount()
            .map(|mount_point| Response::Unmounted { mount_point }),
        Request::FixPermissions => engine.fix_permissions().map(Response::Permissions),
        Request::Install { autostart } => engine.install(autostart).map(Response::Installed),
        Request::Uninstall => engine.uninstall().map(Response::Uninstalled),
        Request::SetAutostart { enabled } => engine
            .set_autostart(enabled)
            .map(|()| Response::AutostartChanged { enabled }),
    }
}

struct Job {
    request: Request,
    reply: mpsc::Sender<Reply>,
}

/// Handle to the worker thread.
pub struct Service {
    jobs: Option<mpsc::Sender<Job>>,
    busy: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Service {
    /// Moves `engine` onto a new worker thread.
    pub fn spawn(engine: Engine) -> Result<Self> {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);

        let worker = thread::Builder::new()
            .name("isomount-worker".to_string())
            .spawn(move || {
                let mut engine = engine;
                for job in inbox {
                    let reply = dispatch(&mut engine, job.request);
                    // Clear before replying so the caller can submit again
                    // as soon as it has the reply.
                    worker_busy.store(false, Ordering::Release);
                    let _ = job.reply.send(reply);
                }
                debug!("worker stopped");
            })
            .map_err(|e| Error::Worker {
                message: e.to_string(),
            })?;

        Ok(Self {
            jobs: Some(jobs),
            busy,
            worker: Some(worker),
        })
    }

    /// Hands `request` to the worker without waiting for it.
    pub fn submit(&self, request: Request) -> Result<Ticket> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SessionBusy {
                state: "another request is in flight".to_string(),
            });
        }

        let (reply, receiver) = mpsc::channel();
        let sent = self
            .jobs
            .as_ref()
            .is_some_and(|jobs| jobs.send(Job { request, reply }).is_ok());
        if !sent {
            self.busy.store(false, Ordering::Release);
            return Err(Error::Worker {
                message: "worker has stopped".to_string(),
            });
        }
        Ok(Ticket { receiver })
    }

    /// Submits `request` and waits for its reply.
    pub fn call(&self, request: Request) -> Reply {
        self.submit(request)?.wait()
    }

    /// True while a request is being processed.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

/// Pending reply for a submitted request.
#[derive(Debug)]
#[must_use = "a ticket does nothing unless waited on"]
pub struct Ticket {
    receiver: mpsc::Receiver<Reply>,
}

impl Ticket {
    /// Blocks until the worker replies.
    pub fn wait(self) -> Reply {
        self.receiver.recv().map_err(|_| Error::Worker {
            message: "worker exited before replying".to_string(),
        })?
    }
}
