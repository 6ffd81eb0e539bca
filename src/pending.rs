/*!
 * Pending-Signal Channel
 * Lock-free hand-off from signal-handler context to the dispatch worker
 */

use crate::types::TrapResult;
use crossbeam_queue::ArrayQueue;
use log::error;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Pending occurrences the ring can hold before new deliveries are dropped.
/// The OS handler shim must not allocate, so the ring is pre-sized.
pub(crate) const RING_CAPACITY: usize = 1024;

const TOKEN_WAKE: u8 = 1;

/// What the worker was woken up for
pub(crate) enum Wakeup {
    /// Drain the ring and dispatch.
    Signal,
    /// This lifecycle's stop pipe was closed; tear the worker down.
    Stop,
}

/// Channel between the OS handler shim (producer) and the dispatch worker
/// (consumer).
///
/// Signal numbers travel through a pre-sized lock-free ring; a wake pipe
/// carries one token byte per delivery so the consumer can block. Both pipe
/// ends are non-blocking (the consumer blocks in `poll(2)`, not in
/// `read(2)`), the producer side never blocks, and a full pipe only ever
/// means a wakeup is already pending. Both producer operations are
/// async-signal-safe (no allocation, no locks, raw `write(2)`).
///
/// The channel lives for the process because the shim needs a `'static`
/// path to it. Teardown is therefore signaled out of band: each worker
/// lifecycle gets its own stop pipe (see [`stop_pipe`]) whose write end the
/// lifecycle controller closes, so a stop can never be misread by a worker
/// from a different lifecycle.
pub(crate) struct PendingQueue {
    ring: ArrayQueue<libc::c_int>,
    wake_tx: OwnedFd,
    wake_rx: OwnedFd,
    dropped: AtomicU64,
}

static CHANNEL: OnceLock<PendingQueue> = OnceLock::new();

impl PendingQueue {
    fn new() -> TrapResult<Self> {
        let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            ring: ArrayQueue::new(RING_CAPACITY),
            wake_tx,
            wake_rx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Process-wide channel, created on first use.
    pub fn global() -> TrapResult<&'static PendingQueue> {
        if let Some(channel) = CHANNEL.get() {
            return Ok(channel);
        }
        let channel = PendingQueue::new()?;
        Ok(CHANNEL.get_or_init(|| channel))
    }

    /// The channel if it has ever been created. Used by the shim, which must
    /// not trigger initialization from handler context.
    pub fn installed() -> Option<&'static PendingQueue> {
        CHANNEL.get()
    }

    /// Producer side, called from OS handler context only. Never blocks,
    /// never allocates. A full ring drops the occurrence and counts it.
    pub fn push_from_handler(&self, signo: libc::c_int) {
        if self.ring.push(signo).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.write_wake();
    }

    /// Hand a consumed wakeup back. Used by an outgoing worker that read a
    /// token after its lifecycle ended, so the successor worker still wakes
    /// for whatever is in the ring.
    pub fn repost_wake(&self) {
        self.write_wake();
    }

    fn write_wake(&self) {
        let token = [TOKEN_WAKE];
        // SAFETY: write(2) is async-signal-safe; the fd and the stack buffer
        // are valid for the duration of the call. A short or failed write
        // (EAGAIN on a full pipe) is fine: the pipe being non-empty already
        // guarantees the worker will wake and drain the ring.
        let _ = unsafe { libc::write(self.wake_tx.as_raw_fd(), token.as_ptr().cast(), 1) };
    }

    /// Oldest pending signal number, if any. Consumer side.
    pub fn pop(&self) -> Option<libc::c_int> {
        self.ring.pop()
    }

    /// Block until a wake token arrives or `stop_rx` reports that its write
    /// end was closed. The worker's only suspension point. A pending stop
    /// outranks pending wakeups.
    pub fn wait(&self, stop_rx: &OwnedFd) -> Wakeup {
        loop {
            let mut fds = [
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
                PollFd::new(stop_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("wake poll failed: {}", err);
                    return Wakeup::Stop;
                }
            }

            let stopped = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            if fds[1].revents().is_some_and(|r| r.intersects(stopped)) {
                return Wakeup::Stop;
            }

            let mut byte = [0u8; 1];
            // SAFETY: non-blocking read of one byte into a stack buffer from
            // the pipe's read end, which we own.
            let n = unsafe { libc::read(self.wake_rx.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
            match n {
                1 => return Wakeup::Signal,
                _ => {
                    let err = Errno::last();
                    // EAGAIN: another reader won the token; poll again.
                    if n < 0 && err != Errno::EAGAIN && err != Errno::EINTR {
                        error!("wake pipe read failed: {}", err);
                        return Wakeup::Stop;
                    }
                }
            }
        }
    }

    /// Discard ring entries left over from a previous lifecycle.
    pub fn discard_stale(&self) -> usize {
        let mut discarded = 0;
        while self.ring.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Occurrences dropped on a full ring since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

/// Per-lifecycle stop pipe: the worker polls the read end; the lifecycle
/// controller closes the write end to order a shutdown. Nothing is ever
/// written through it, so a stop cannot be consumed by the wrong worker.
pub(crate) fn stop_pipe() -> TrapResult<(OwnedFd, OwnedFd)> {
    let (stop_rx, stop_tx) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((stop_rx, stop_tx))
}
