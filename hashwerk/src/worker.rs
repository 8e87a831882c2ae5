//! The worker loop.
//!
//! A worker registers itself, polls its queues round-robin, runs one task
//! at a time and heartbeats between jobs. SIGTERM/SIGINT set a flag that
//! the shell runner polls, so an interrupted task writes `KilledBySignal`
//! to its outputs before the worker exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use convenient_hub::WorkerInfo;
use tracing::{error, info, info_span, warn};

use crate::errors::Result;
use crate::hashes::ContentHash;
use crate::jobs::Job;
use crate::session::Session;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Cadence of the background heartbeat, well under the staleness window
/// lock stealing uses.
const BEAT_EVERY: Duration = Duration::from_secs(15);

/// Whether this process received a termination signal.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic flag.
    #[allow(unsafe_code)]
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &action);
        let _ = sigaction(Signal::SIGINT, &action);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    "localhost".to_string()
}

/// Generate a unique worker id: `<host>-<pid>-<hex>`.
#[must_use]
pub fn worker_id() -> String {
    format!(
        "{}-{}-{:08x}",
        hostname(),
        std::process::id(),
        rand::random::<u32>()
    )
}

fn queues_empty(session: &Session, queues: &[String]) -> Result<bool> {
    for queue in queues {
        if session.hub.queue_len(queue)? > 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Run a worker until shutdown (or, in burst mode, until the queues are
/// drained).
///
/// # Errors
///
/// Propagates hub failures. Failures of individual tasks are logged and
/// do not stop the worker.
pub fn run_worker(session: &Session, queues: Vec<String>, burst: bool) -> Result<()> {
    let queues = if queues.is_empty() {
        vec!["default".to_string()]
    } else {
        queues
    };
    let id = worker_id();
    install_signal_handlers();
    session.hub.worker_register(&WorkerInfo {
        id: id.clone(),
        queues: queues.clone(),
        pid: std::process::id(),
    })?;
    info!(
        "worker {id} on queues={}{}",
        queues.join(", "),
        if burst { " in burst mode" } else { "" }
    );

    // Beat from a dedicated thread so long-running tasks do not make this
    // worker look dead to the lock-stealing logic.
    let stop_beat = Arc::new(AtomicBool::new(false));
    let beat_handle = {
        let session = session.clone();
        let id = id.clone();
        let stop = Arc::clone(&stop_beat);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let _ = session.hub.worker_beat(&id);
                let mut slept = Duration::ZERO;
                while slept < BEAT_EVERY && !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                    slept += Duration::from_millis(100);
                }
            }
        })
    };

    let outcome = worker_loop(session, &id, &queues, burst);

    stop_beat.store(true, Ordering::SeqCst);
    let _ = beat_handle.join();
    session.hub.worker_deregister(&id)?;
    info!("worker {id} stopped");
    outcome
}

fn worker_loop(session: &Session, id: &str, queues: &[String], burst: bool) -> Result<()> {
    loop {
        if shutdown_requested() {
            warn!("termination signal received, stopping");
            return Ok(());
        }
        if session.hub.worker_shutdown_requested(id)? {
            info!("shutdown requested through the hub, stopping");
            return Ok(());
        }

        let Some((_queue, payload)) = session.hub.queue_pop(queues, POP_TIMEOUT)? else {
            session.hub.worker_beat(id)?;
            if burst && queues_empty(session, queues)? {
                info!("queues drained, burst worker done");
                return Ok(());
            }
            continue;
        };

        let job = match Job::unpack(&payload) {
            Ok(job) => job,
            Err(e) => {
                error!("dropping malformed job payload: {e}");
                continue;
            }
        };
        let op = match ContentHash::from_hex(&job.op) {
            Ok(op) => op,
            Err(e) => {
                error!("dropping job with bad op hash: {e}");
                continue;
            }
        };

        session.hub.worker_set_job(id, op.as_str())?;
        let span = info_span!("task", op = op.short());
        let result = span.in_scope(|| crate::dag::task(session, &job.dag, &op, Some(id)));
        if let Err(e) = result {
            error!("task {} failed: {e}", op.short());
        }
        session.hub.worker_clear_job(id)?;
        session.hub.worker_beat(id)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_unique() {
        assert_ne!(worker_id(), worker_id());
    }

    #[test]
    fn burst_worker_exits_on_empty_queues() {
        let session = Session::in_memory();
        run_worker(&session, vec!["default".to_string()], true).unwrap();
        assert!(session.hub.workers().unwrap().is_empty());
    }
}
