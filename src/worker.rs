/*!
 * Dispatch Worker
 * Single background thread that executes callbacks outside handler context
 */

use crate::pending::{PendingQueue, Wakeup};
use crate::registry::TrapRegistry;
use crate::types::TrapResult;
use log::{debug, error, warn};
use nix::libc;
use nix::sys::signal::Signal;
use std::os::fd::OwnedFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle to the single running dispatch thread.
pub(crate) struct DispatchWorker {
    handle: JoinHandle<()>,
}

impl DispatchWorker {
    /// Spawn the worker for one lifecycle. `stop_rx` is this lifecycle's
    /// stop pipe; `alive` is cleared by the lifecycle controller at
    /// shutdown so a retiring worker stops consuming ring entries that
    /// belong to its successor.
    pub fn spawn(
        registry: Arc<TrapRegistry>,
        channel: &'static PendingQueue,
        stop_rx: OwnedFd,
        alive: Arc<AtomicBool>,
    ) -> TrapResult<Self> {
        let handle = thread::Builder::new()
            .name("sigdefer-dispatch".into())
            .spawn(move || run(registry, channel, stop_rx, alive))?;
        Ok(Self { handle })
    }

    /// Wait for the worker to exit. Skipped when called from the worker
    /// thread itself (a callback invoking `stop`), which would self-join.
    pub fn join(self) {
        if thread::current().id() == self.handle.thread().id() {
            debug!("stop requested from dispatch worker thread, skipping join");
            return;
        }
        if self.handle.join().is_err() {
            error!("dispatch worker terminated by panic");
        }
    }
}

fn run(
    registry: Arc<TrapRegistry>,
    channel: &'static PendingQueue,
    stop_rx: OwnedFd,
    alive: Arc<AtomicBool>,
) {
    debug!("dispatch worker started");
    loop {
        match channel.wait(&stop_rx) {
            Wakeup::Stop => break,
            Wakeup::Signal => {
                if !alive.load(Ordering::SeqCst) {
                    // This wakeup belongs to a successor lifecycle; hand it
                    // back so the fresh worker still wakes for the ring.
                    channel.repost_wake();
                    break;
                }
                while alive.load(Ordering::SeqCst) {
                    match channel.pop() {
                        Some(signo) => dispatch(&registry, signo),
                        None => break,
                    }
                }
            }
        }
    }
    debug!("dispatch worker stopped");
}

/// Run every callback registered for one signal occurrence, in registration
/// order. A panicking callback is reported and skipped; it must not prevent
/// later callbacks or later occurrences from dispatching.
fn dispatch(registry: &TrapRegistry, signo: libc::c_int) {
    let signal = match Signal::try_from(signo) {
        Ok(signal) => signal,
        Err(_) => {
            warn!("ignoring unknown signal number {} in pending channel", signo);
            return;
        }
    };

    let callbacks = match registry.callbacks(signal) {
        Some(callbacks) => callbacks,
        None => {
            debug!("no callbacks registered for {}, dropping occurrence", signal);
            return;
        }
    };

    debug!("dispatching {} to {} callback(s)", signal, callbacks.len());
    for (index, callback) in callbacks.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            error!("callback {} for {} panicked, continuing dispatch", index, signal);
        }
    }
}
