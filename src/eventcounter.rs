//! The counter context (spec §3/§4.5): an in-memory 64-bit counter with
//! semaphore-or-sum semantics, surfaced through an `EVFILT_USER` filter on
//! its own kqueue handle so a [`crate::pollset::PollSet`] can watch it uniformly
//! alongside real descriptors. Per spec §1 this is out of the core budget —
//! a thin wrapper, not a state machine.

use crate::registry::{self, Kind as RegistryKind};
use crate::sys::kqueue::Selector;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

/// A kqueue-backed stand-in for Linux `eventfd`.
pub struct EventCounter {
    selector: Selector,
    value: Mutex<u64>,
    semaphore: bool,
}

impl EventCounter {
    /// `semaphore = true` gives `eventfd`'s `EFD_SEMAPHORE` behaviour: each
    /// `read` consumes exactly 1 and leaves the rest pending. Otherwise each
    /// `read` drains and returns the whole accumulated value.
    pub fn new(initval: u64, semaphore: bool) -> io::Result<EventCounter> {
        let selector = Selector::new()?;
        registry::register(selector.as_raw_fd(), RegistryKind::Counter);
        selector.submit(&[user_filter_add()])?;

        let counter = EventCounter {
            selector,
            value: Mutex::new(initval),
            semaphore,
        };
        if initval > 0 {
            counter.trigger();
        }
        Ok(counter)
    }

    pub fn add(&self, delta: u64) -> io::Result<()> {
        let mut v = self.value.lock().unwrap();
        *v = v.checked_add(delta).ok_or_else(overflow)?;
        let now_nonzero = *v > 0;
        drop(v);
        if now_nonzero {
            self.trigger();
        }
        Ok(())
    }

    /// Read and consume, per the constructor's semaphore/sum mode.
    /// Non-blocking: `EAGAIN` if the counter is currently zero.
    pub fn read(&self) -> io::Result<u64> {
        let mut v = self.value.lock().unwrap();
        if *v == 0 {
            return Err(try_again());
        }

        let out = if self.semaphore { 1 } else { *v };
        *v -= out;
        let remaining = *v;
        drop(v);

        if remaining > 0 {
            self.trigger();
        }
        Ok(out)
    }

    fn trigger(&self) {
        let kev = libc::kevent {
            ident: 0,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER as _,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let _ = self.selector.submit(&[kev]);
    }
}

impl AsRawFd for EventCounter {
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}

impl Drop for EventCounter {
    fn drop(&mut self) {
        registry::unregister(self.selector.as_raw_fd());
    }
}

fn user_filter_add() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: libc::EVFILT_USER,
        flags: (libc::EV_ADD | libc::EV_CLEAR) as _,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn overflow() -> io::Error {
    io::Error::from_raw_os_error(libc::EOVERFLOW)
}

fn try_again() -> io::Error {
    io::Error::from_raw_os_error(libc::EAGAIN)
}

#[cfg(test)]
mod tests {
    // Construction requires a live kqueue; semaphore/sum arithmetic itself
    // is exercised indirectly through the live-kqueue integration tests.
}
