//! The signal context (spec §3/§4.5): an external-collaborator-grade
//! wrapper that blocks a signal set for the calling thread and exposes
//! deliveries as readable records, so it can sit inside a [`crate::pollset::PollSet`]
//! uniformly with everything else. Per spec §1 this is out of the core
//! budget — straightforward, not a state machine.

use crate::registry::{self, Kind as RegistryKind};
use crate::sigset::SigSet;
use crate::sys::kqueue::Selector;

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};

/// One delivered signal, as read off a [`Signalfd`].
#[derive(Clone, Copy, Debug)]
pub struct SignalInfo {
    pub signo: i32,
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
}

/// A kqueue-backed stand-in for Linux `signalfd`.
///
/// Blocks `mask` for the current thread (signals in it must already be
/// blocked process-wide by the caller for reliable delivery across threads,
/// same caveat as real `signalfd`) and additionally arms an `EVFILT_SIGNAL`
/// watch per signal so a [`crate::pollset::PollSet`] observing this descriptor sees
/// readability without polling.
pub struct Signalfd {
    selector: Selector,
    mask: SigSet,
}

impl Signalfd {
    pub fn new(mask: SigSet) -> io::Result<Signalfd> {
        let selector = Selector::new()?;
        registry::register(selector.as_raw_fd(), RegistryKind::Signal);

        syscall!(pthread_sigmask(libc::SIG_BLOCK, mask.as_raw(), std::ptr::null_mut()))?;

        let mut changes = Vec::new();
        for signo in 1..libc::NSIG {
            if mask.contains(signo).unwrap_or(false) {
                changes.push(libc::kevent {
                    ident: signo as libc::uintptr_t,
                    filter: libc::EVFILT_SIGNAL,
                    flags: (libc::EV_ADD | libc::EV_ENABLE) as _,
                    fflags: 0,
                    data: 0,
                    udata: std::ptr::null_mut(),
                });
            }
        }
        selector.submit(&changes)?;

        Ok(Signalfd { selector, mask })
    }

    /// Read one pending signal, non-blocking.
    pub fn read(&self) -> io::Result<SignalInfo> {
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let mut info: libc::siginfo_t = unsafe { MaybeUninit::zeroed().assume_init() };

        let signo = unsafe { libc::sigtimedwait(self.mask.as_raw(), &mut info, &zero) };
        if signo == -1 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EAGAIN) {
                try_again()
            } else {
                err
            });
        }

        Ok(SignalInfo {
            signo,
            pid: info.si_pid,
            uid: info.si_uid,
        })
    }
}

impl AsRawFd for Signalfd {
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}

impl Drop for Signalfd {
    fn drop(&mut self) {
        registry::unregister(self.selector.as_raw_fd());
    }
}

fn try_again() -> io::Error {
    io::Error::from_raw_os_error(libc::EAGAIN)
}
