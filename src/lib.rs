/*!
 * sigdefer
 * Deferred dispatch of trapped OS signals
 *
 * OS signal handlers run in a restricted context where most code is unsafe
 * to execute: locks, heap allocation, blocking I/O, and logging can all
 * deadlock or corrupt state when they interrupt arbitrary code. This crate
 * installs a minimal handler shim whose only job is to hand the signal off
 * to a single background worker thread, where registered callbacks then run
 * in an ordinary context, one at a time, in registration order.
 *
 * ```no_run
 * sigdefer::trap(["INT", "TERM"], || {
 *     log::warn!("interrupted, shutting down");
 * })
 * .unwrap();
 *
 * // ... later: reinstall the previous handlers and stop the worker
 * sigdefer::stop();
 * ```
 *
 * Delivery order is preserved globally: occurrences dispatch in the order
 * the OS delivered them, and all callbacks share the one worker thread, so
 * a slow callback delays everything behind it. That trade-off buys strict
 * ordering and handler-context safety.
 */

mod broker;
mod pending;
mod registry;
mod shim;
mod types;
mod worker;

// Re-export public API
pub use broker::{stop, trap};
pub use types::{Callback, TrapError, TrapResult};

// The signal type callers see in errors and can match on.
pub use nix::sys::signal::Signal;
