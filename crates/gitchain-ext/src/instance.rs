//! Extension instance lifecycle
//!
//! An [`ExtensionInstance`] is a cheap, clonable handle to one prepared
//! extension. Running it spawns the scheduler thread that owns the
//! interpreter; stopping it, or interrupting the host token it was prepared
//! with, signals cancellation and permanently closes the handle.

use crate::context::{Args, ScriptSeed};
use crate::error::{ExtensionError, Result};
use crate::scheduler;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why a run of an extension ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The body finished and no timers remained
    Completed,
    /// Stopped by the instance, its manager or the host
    Cancelled,
    /// Uncaught exception in the body, a callback or a promise job
    Failed(String),
}

/// Observable state of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Prepared, never run
    Created,
    /// Scheduler thread is alive
    Running,
    /// Last run ended
    Stopped(ExitReason),
}

impl InstanceStatus {
    /// Whether the scheduler is alive
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    /// How the last run ended, if one did
    pub fn exit_reason(&self) -> Option<&ExitReason> {
        match self {
            InstanceStatus::Stopped(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Invoked on the scheduler thread once a run has ended. The argument
/// publishes the final status; hooks call it while their own bookkeeping is
/// still locked so observers never see one without the other.
pub(crate) type ExitHook = Box<dyn FnOnce(&mut dyn FnMut()) + Send>;

struct InstanceInner {
    seed: Arc<ScriptSeed>,
    cancel: CancellationToken,
    closed: AtomicBool,
    status: watch::Sender<InstanceStatus>,
}

/// Handle to a prepared extension
#[derive(Clone)]
pub struct ExtensionInstance {
    inner: Arc<InstanceInner>,
}

impl ExtensionInstance {
    pub(crate) fn new(seed: Arc<ScriptSeed>, cancel: CancellationToken) -> Self {
        let (status, _) = watch::channel(InstanceStatus::Created);
        Self {
            inner: Arc::new(InstanceInner {
                seed,
                cancel,
                closed: AtomicBool::new(false),
                status,
            }),
        }
    }

    /// Extension name
    pub fn name(&self) -> &str {
        &self.inner.seed.name
    }

    /// Script the extension was loaded from
    pub fn path(&self) -> &Path {
        &self.inner.seed.path
    }

    /// Arguments the script sees as `args`
    pub fn args(&self) -> &Args {
        &self.inner.seed.args
    }

    /// Start the extension.
    ///
    /// Returns once the script body has been evaluated. A second call while
    /// running is a no-op; a call after [`stop`](Self::stop) fails with
    /// [`ExtensionError::Closed`]. A body that throws is reported through
    /// logging and the instance status, not as an error here.
    pub fn run(&self) -> Result<()> {
        self.start(None).map(|_| ())
    }

    /// Start a run; `Ok(false)` when one was already in progress, in which
    /// case `on_exit` is dropped without being called.
    pub(crate) fn start(&self, on_exit: Option<ExitHook>) -> Result<bool> {
        if self.is_closed() {
            return Err(ExtensionError::Closed(self.name().to_string()));
        }

        let mut claimed = false;
        self.inner.status.send_if_modified(|status| {
            if status.is_running() {
                false
            } else {
                *status = InstanceStatus::Running;
                claimed = true;
                true
            }
        });
        if !claimed {
            debug!("Extension {} is already running", self.name());
            return Ok(false);
        }

        info!(extension = %self.name(), path = ?self.path(), "Starting extension");

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let instance = self.clone();
        let spawned = scheduler::spawn(
            Arc::clone(&self.inner.seed),
            self.inner.cancel.clone(),
            ready_tx,
            move |reason| instance.finish(reason, on_exit),
        );

        if let Err(source) = spawned {
            self.inner.status.send_replace(InstanceStatus::Stopped(ExitReason::Failed(
                source.to_string(),
            )));
            return Err(ExtensionError::Spawn {
                name: self.name().to_string(),
                source,
            });
        }

        // Either the body was evaluated or the run already ended.
        let _ = ready_rx.recv();
        Ok(true)
    }

    /// Record the end of a run. The status flips from inside the hook, or
    /// right away when there is none.
    fn finish(&self, reason: ExitReason, on_exit: Option<ExitHook>) {
        match &reason {
            ExitReason::Completed => info!(extension = %self.name(), "Extension completed"),
            ExitReason::Cancelled => info!(extension = %self.name(), "Extension stopped"),
            ExitReason::Failed(message) => {
                error!(extension = %self.name(), error = %message, "Extension failed")
            }
        }

        let status = &self.inner.status;
        let mut pending = Some(reason);
        let mut publish = || {
            if let Some(reason) = pending.take() {
                status.send_replace(InstanceStatus::Stopped(reason));
            }
        };
        if let Some(hook) = on_exit {
            hook(&mut publish);
        }
        // Hooks that never publish still leave the instance stopped.
        publish();
    }

    /// Stop the extension and close the handle for good. Idempotent.
    ///
    /// A callback already executing finishes; nothing runs after it.
    pub fn stop(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Stopping extension {}", self.name());
        }
        self.inner.cancel.cancel();
    }

    /// Whether the scheduler is alive and the handle is not closed
    pub fn is_running(&self) -> bool {
        !self.is_closed() && self.inner.status.borrow().is_running()
    }

    /// Whether [`stop`](Self::stop) was called or the host interrupt fired
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.cancel.is_cancelled()
    }

    /// Current status
    pub fn status(&self) -> InstanceStatus {
        self.inner.status.borrow().clone()
    }

    /// Wait until the current run has ended and report why.
    ///
    /// Returns immediately if the last run already ended; waits for a first
    /// run to end if the instance was never started.
    pub async fn stopped(&self) -> ExitReason {
        let mut status = self.inner.status.subscribe();
        match status.wait_for(|status| status.exit_reason().is_some()).await {
            Ok(status) => status.exit_reason().cloned().unwrap_or(ExitReason::Cancelled),
            Err(_) => ExitReason::Cancelled,
        }
    }

    /// Whether two handles refer to the same instance
    pub fn same(&self, other: &ExtensionInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}
