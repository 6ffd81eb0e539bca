/*!
 * OS Handler Shim
 * The function actually installed as the OS-level signal handler
 */

use crate::pending::PendingQueue;
use crate::types::TrapResult;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Install the shim for `signal`, returning the handler that was previously
/// in effect so it can be restored on teardown.
pub(crate) fn install(signal: Signal) -> TrapResult<SigAction> {
    let action = SigAction::new(
        SigHandler::Handler(enqueue_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: enqueue_signal restricts itself to async-signal-safe
    // operations (raw write(2) and a lock-free ring push).
    let previous = unsafe { sigaction(signal, &action) }?;
    Ok(previous)
}

/// Reinstall a previously captured handler.
pub(crate) fn restore(signal: Signal, previous: &SigAction) -> TrapResult<()> {
    // SAFETY: reinstalls exactly the disposition that was in effect before
    // install() replaced it.
    unsafe { sigaction(signal, previous) }?;
    Ok(())
}

/// The OS-level handler. Runs in restricted handler context: its only job
/// is the diagnostic line and the hand-off to the pending channel. User
/// callbacks are never invoked from here.
pub(crate) extern "C" fn enqueue_signal(signo: libc::c_int) {
    // write(2) and the ring push can clobber errno; the interrupted code
    // must not observe that.
    let saved = Errno::last_raw();
    if let Ok(signal) = Signal::try_from(signo) {
        write_caught_note(signal);
    }
    if let Some(channel) = PendingQueue::installed() {
        channel.push_from_handler(signo);
    }
    Errno::set_raw(saved);
}

/// Diagnostic line on stderr, composed in a stack buffer. No allocation,
/// no locks, no std I/O machinery.
fn write_caught_note(signal: Signal) {
    const PREFIX: &[u8] = b"sigdefer: caught ";
    let name = signal.as_str().as_bytes();
    let mut buf = [0u8; 48];
    let mut len = 0;
    for chunk in [PREFIX, name, b"\n".as_slice()] {
        let end = len + chunk.len();
        if end > buf.len() {
            return;
        }
        buf[len..end].copy_from_slice(chunk);
        len = end;
    }
    // SAFETY: write(2) is async-signal-safe; buf outlives the call.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len) };
}
