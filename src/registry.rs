/*!
 * Trap Registry
 * Per-signal callback lists and previously-installed OS handlers
 */

use crate::types::{Callback, TrapResult};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use nix::sys::signal::{SigAction, Signal};

/// State held for one trapped signal
pub(crate) struct HandlerEntry {
    /// OS handler in effect before the shim was installed; captured on the
    /// first registration for this signal and never overwritten.
    pub previous: SigAction,
    /// Registered callbacks, in registration order.
    pub callbacks: Vec<Callback>,
}

/// Process-wide map of trapped signals.
///
/// Mutated only from normal-context calls (`trap`, `stop`); the dispatch
/// worker takes read-only snapshots.
pub(crate) struct TrapRegistry {
    entries: DashMap<Signal, HandlerEntry, RandomState>,
}

impl TrapRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Append `callback` to the entry for `signal`, creating the entry on
    /// first registration. `capture` runs exactly once per signal, on that
    /// first registration; it installs the OS-level shim and returns the
    /// handler that was previously in effect. A failed capture leaves no
    /// entry behind.
    pub fn register<F>(&self, signal: Signal, callback: Callback, capture: F) -> TrapResult<()>
    where
        F: FnOnce() -> TrapResult<SigAction>,
    {
        match self.entries.entry(signal) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().callbacks.push(callback);
                debug!(
                    "appended callback for {} ({} registered)",
                    signal,
                    entry.get().callbacks.len()
                );
            }
            Entry::Vacant(entry) => {
                let previous = capture()?;
                entry.insert(HandlerEntry {
                    previous,
                    callbacks: vec![callback],
                });
                debug!("first registration for {}, previous handler captured", signal);
            }
        }
        Ok(())
    }

    /// Snapshot of the callback list for `signal`, in registration order.
    pub fn callbacks(&self, signal: Signal) -> Option<Vec<Callback>> {
        self.entries
            .get(&signal)
            .map(|entry| entry.callbacks.clone())
    }

    /// Remove every entry, yielding each signal with its captured previous
    /// handler so the caller can restore them.
    pub fn drain(&self) -> Vec<(Signal, SigAction)> {
        let signals: Vec<Signal> = self.entries.iter().map(|entry| *entry.key()).collect();
        signals
            .into_iter()
            .filter_map(|signal| {
                self.entries
                    .remove(&signal)
                    .map(|(_, entry)| (signal, entry.previous))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{SaFlags, SigHandler, SigSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn default_action() -> SigAction {
        SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
    }

    fn noop() -> Callback {
        Arc::new(|| {})
    }

    #[test]
    fn capture_runs_once_per_signal() {
        let registry = TrapRegistry::new();
        let captures = AtomicUsize::new(0);

        for _ in 0..3 {
            registry
                .register(Signal::SIGUSR1, noop(), || {
                    captures.fetch_add(1, Ordering::SeqCst);
                    Ok(default_action())
                })
                .unwrap();
        }

        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(registry.callbacks(Signal::SIGUSR1).unwrap().len(), 3);
    }

    #[test]
    fn failed_capture_leaves_no_entry() {
        let registry = TrapRegistry::new();
        let result = registry.register(Signal::SIGUSR1, noop(), || {
            Err(nix::errno::Errno::EINVAL.into())
        });

        assert!(result.is_err());
        assert!(registry.callbacks(Signal::SIGUSR1).is_none());
    }

    #[test]
    fn callbacks_snapshot_preserves_registration_order() {
        let registry = TrapRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in 1..=3 {
            let order = order.clone();
            registry
                .register(
                    Signal::SIGUSR1,
                    Arc::new(move || order.lock().push(tag)),
                    || Ok(default_action()),
                )
                .unwrap();
        }

        for callback in registry.callbacks(Signal::SIGUSR1).unwrap() {
            callback();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn drain_clears_all_entries() {
        let registry = TrapRegistry::new();
        registry
            .register(Signal::SIGUSR1, noop(), || Ok(default_action()))
            .unwrap();
        registry
            .register(Signal::SIGUSR2, noop(), || Ok(default_action()))
            .unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.callbacks(Signal::SIGUSR1).is_none());
        assert!(registry.callbacks(Signal::SIGUSR2).is_none());
    }
}
