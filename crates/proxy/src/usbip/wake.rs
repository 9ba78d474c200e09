//! Cross-thread wake-up for the I/O thread
//!
//! An eventfd the I/O thread polls next to its socket. Signals coalesce:
//! any number of `signal` calls before the next `drain` produce one wake-up.

use nix::sys::eventfd::{EfdFlags, EventFd};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

pub(crate) struct WakeEvent {
    fd: EventFd,
}

impl WakeEvent {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Wake the poller
    pub(crate) fn signal(&self) {
        // EAGAIN means the counter is saturated; the poller is awake anyway.
        if let Err(e) = self.fd.write(1) {
            tracing::trace!("eventfd write: {}", e);
        }
    }

    /// Consume pending signals; returns whether there were any
    pub(crate) fn drain(&self) -> bool {
        matches!(self.fd.read(), Ok(n) if n > 0)
    }
}

impl AsFd for WakeEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
