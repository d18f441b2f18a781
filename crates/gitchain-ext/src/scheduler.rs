//! Per-extension scheduler
//!
//! Every running extension gets a dedicated OS thread with a current-thread
//! tokio runtime. The thread builds the extension's interpreter context,
//! evaluates the script body once and then serves fired timers until the
//! registry is empty or cancellation is requested. It is the only thread that
//! ever touches that context, so the body and all callbacks of one extension
//! are strictly serialized while different extensions run in parallel.

use crate::context::{ScriptContext, ScriptSeed};
use crate::error::ExtensionError;
use crate::instance::ExitReason;
use std::any::Any;
use std::future::poll_fn;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Spawn the scheduler thread for a prepared extension.
///
/// `ready` receives a message once the script body has been evaluated
/// successfully; it is dropped only after `finish` has run, so a caller
/// blocked on it observes the final state of a script that failed early.
pub(crate) fn spawn<F>(
    seed: Arc<ScriptSeed>,
    cancel: CancellationToken,
    ready: SyncSender<()>,
    finish: F,
) -> std::io::Result<()>
where
    F: FnOnce(ExitReason) + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("ext-{}", seed.name))
        .spawn(move || {
            let reason = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(drive(&seed, &cancel, &ready))
                }))
                .unwrap_or_else(|payload| {
                    ExitReason::Failed(format!("scheduler panicked: {}", panic_message(&*payload)))
                }),
                Err(err) => ExitReason::Failed(format!("failed to start scheduler runtime: {err}")),
            };
            finish(reason);
            drop(ready);
        })?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Build the context, evaluate the body, then run the timer loop
async fn drive(seed: &ScriptSeed, cancel: &CancellationToken, ready: &SyncSender<()>) -> ExitReason {
    if cancel.is_cancelled() {
        return ExitReason::Cancelled;
    }

    let script = match ScriptContext::new(seed) {
        Ok(script) => script,
        Err(err) => return failure(err),
    };

    if let Err(err) = script.eval(&seed.source) {
        script.timers().borrow_mut().clear_all();
        return failure(err);
    }

    let _ = ready.try_send(());
    debug!(
        extension = %seed.name,
        timers = script.timers().borrow().len(),
        "Script body evaluated"
    );

    run_timers(&script, cancel, &seed.name).await
}

/// Serve fired timers until the registry empties or `cancel` fires.
///
/// Waiting blocks on both sources at once; cancellation is observed between
/// callbacks and never interrupts one that is executing.
pub(crate) async fn run_timers(
    script: &ScriptContext,
    cancel: &CancellationToken,
    name: &str,
) -> ExitReason {
    let timers = script.timers();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                timers.borrow_mut().clear_all();
                return ExitReason::Cancelled;
            }
            next = poll_fn(|cx| timers.borrow_mut().poll_expired(cx)) => next,
        };

        let Some(id) = next else {
            return ExitReason::Completed;
        };
        let Some(repeating) = timers.borrow_mut().take_fired(id) else {
            continue;
        };

        trace!(extension = %name, timer = id, repeating, "Timer fired");
        if let Err(err) = script.fire(id, repeating) {
            timers.borrow_mut().clear_all();
            return failure(err);
        }

        if repeating {
            timers.borrow_mut().rearm(id);
        }
    }
}

fn failure(err: ExtensionError) -> ExitReason {
    match err {
        ExtensionError::Script { message, .. } => ExitReason::Failed(message),
        other => ExitReason::Failed(other.to_string()),
    }
}
