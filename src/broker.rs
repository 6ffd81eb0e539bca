/*!
 * Signal Broker
 * Lifecycle controller: lazy worker start, trap registration, teardown
 */

use crate::pending::{self, PendingQueue};
use crate::registry::TrapRegistry;
use crate::shim;
use crate::types::{Callback, TrapError, TrapResult};
use crate::worker::DispatchWorker;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide singleton. Present while the system is active: absent until
/// the first `trap`, absent again after `stop`.
static BROKER: Mutex<Option<SignalBroker>> = Mutex::new(None);

/// Owns the registry and the dispatch worker for one lifecycle. The stop
/// pipe and the `alive` flag belong to this lifecycle alone, so tearing one
/// broker down cannot disturb a successor's worker.
struct SignalBroker {
    registry: Arc<TrapRegistry>,
    worker: DispatchWorker,
    alive: Arc<AtomicBool>,
    stop_tx: OwnedFd,
}

impl SignalBroker {
    fn start() -> TrapResult<Self> {
        let channel = PendingQueue::global()?;
        let stale = channel.discard_stale();
        if stale > 0 {
            debug!("discarded {} stale pending signal(s) from previous lifecycle", stale);
        }
        let registry = Arc::new(TrapRegistry::new());
        let (stop_rx, stop_tx) = pending::stop_pipe()?;
        let alive = Arc::new(AtomicBool::new(true));
        let worker = DispatchWorker::spawn(registry.clone(), channel, stop_rx, alive.clone())?;
        info!("signal broker started");
        Ok(Self {
            registry,
            worker,
            alive,
            stop_tx,
        })
    }

    fn trap(&self, signals: &[Signal], callback: Callback) -> TrapResult<()> {
        for &signal in signals {
            self.registry
                .register(signal, callback.clone(), || shim::install(signal))?;
            info!("trapped {}", signal);
        }
        Ok(())
    }

    /// Restore every previous handler, stop the worker, discard leftovers.
    /// The registry is cleared and the `alive` flag lowered before the stop
    /// pipe closes, so anything the worker still drains on its way out
    /// dispatches to nothing and nothing queued for a successor lifecycle
    /// is consumed by the retiring worker.
    fn shutdown(self) {
        for (signal, previous) in self.registry.drain() {
            match shim::restore(signal, &previous) {
                Ok(()) => info!("restored previous handler for {}", signal),
                Err(err) => warn!("failed to restore previous handler for {}: {}", signal, err),
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        // EOF on the stop pipe is the shutdown order; only this lifecycle's
        // worker polls its read end.
        drop(self.stop_tx);
        self.worker.join();

        // Undispatched ring entries are left for the next lifecycle's start
        // to discard; scrubbing them here could race a successor broker
        // already feeding the ring from another thread.
        if let Some(channel) = PendingQueue::installed() {
            let dropped = channel.take_dropped();
            if dropped > 0 {
                warn!("{} signal occurrence(s) dropped on full pending ring", dropped);
            }
        }
        info!("signal broker stopped");
    }
}

/// Register `callback` against one or more signal names.
///
/// Names are resolved before anything is registered, so an unknown name
/// fails with [`TrapError::UnknownSignal`] and leaves no signal trapped.
/// The first call starts the dispatch worker; the first registration for
/// each signal installs the OS-level shim and captures whatever handler was
/// previously in effect. Callbacks for one signal run in registration
/// order, on the worker thread, never in handler context.
pub fn trap<I, S, F>(signals: I, callback: F) -> TrapResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn() + Send + Sync + 'static,
{
    let signals = signals
        .into_iter()
        .map(|name| crate::types::resolve_signal(name.as_ref()))
        .collect::<TrapResult<Vec<Signal>>>()?;

    for &signal in &signals {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            return Err(TrapError::Uncatchable(signal));
        }
    }
    if signals.is_empty() {
        return Ok(());
    }

    let callback: Callback = Arc::new(callback);
    let mut guard = BROKER.lock();
    let broker = match guard.as_mut() {
        Some(broker) => broker,
        None => guard.insert(SignalBroker::start()?),
    };
    broker.trap(&signals, callback)
}

/// Restore the previous OS-level handler for every trapped signal, stop the
/// dispatch worker, and clear all registration state.
///
/// Idempotent: with nothing trapped this is a silent no-op. After `stop`
/// the system is pristine; a subsequent [`trap`] starts a fresh worker and
/// recaptures whatever handlers are installed at that point.
pub fn stop() {
    let broker = BROKER.lock().take();
    match broker {
        Some(broker) => broker.shutdown(),
        None => debug!("stop called with no active signal broker"),
    }
}
