/*!
 * Trap Types
 * Signal name resolution, callback type, and error taxonomy
 */

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Trap operation result
pub type TrapResult<T> = Result<T, TrapError>;

/// Errors surfaced synchronously by registration and lifecycle calls
#[derive(Error, Debug)]
pub enum TrapError {
    #[error("unknown signal name: {0:?}")]
    UnknownSignal(String),

    #[error("signal {0} cannot be trapped")]
    Uncatchable(Signal),

    #[error("signal system call failed: {0}")]
    Os(#[from] Errno),

    #[error("failed to spawn dispatch worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Zero-argument action executed on the dispatch worker.
///
/// Shared so that one closure can be registered against several signals.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Resolve a signal name into its OS signal.
///
/// Accepts the bare name (`"INT"`, any case) or the `SIG`-prefixed form
/// (`"SIGINT"`).
pub fn resolve_signal(name: &str) -> TrapResult<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| TrapError::UnknownSignal(name.to_string()))
}
