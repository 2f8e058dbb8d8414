use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One kqueue(2) kernel object.
///
/// Every emulated descriptor in this crate (a [`crate::pollset::PollSet`], a
/// [`crate::timer::TimerFd`], a [`crate::signalfd::Signalfd`], an
/// [`crate::eventcounter::EventCounter`]) owns exactly one `Selector`. That
/// is also what makes nested watching work for free: a kqueue file
/// descriptor is itself pollable for readability by another kqueue, so
/// "register a timerfd with an epoll set" and "register an epoll set inside
/// another epoll set" (spec §4.1's one level of nesting) are the same
/// mechanism — add `other.as_raw_fd()` as a read-filter target.
pub struct Selector {
    id: usize,
    kq: OwnedFd,
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = syscall!(kqueue())?;

        Ok(Selector {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Process-wide unique id, used to detect a registration being reused
    /// against a different polling set than the one it was added to.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Apply a batch of filter changes with no output events expected.
    pub fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as i32,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))?;

        Ok(())
    }

    /// Apply a single filter change, tolerating `ENOENT` (already gone) when
    /// `ignore_enoent` is set — used when tearing down filters that may
    /// never have been successfully added.
    pub fn apply(&self, change: libc::kevent, ignore_enoent: bool) -> io::Result<()> {
        match self.submit(std::slice::from_ref(&change)) {
            Ok(()) => Ok(()),
            Err(e) if ignore_enoent && e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block for up to `timeout` (`None` = forever) waiting for any
    /// registered filter to fire, writing raw events into `out` and
    /// returning how many were written.
    pub fn wait(&self, out: &mut [libc::kevent], timeout: Option<Duration>) -> io::Result<usize> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            std::ptr::null(),
            0,
            out.as_mut_ptr(),
            out.len() as i32,
            ts_ptr,
        ))?;

        Ok(n as usize)
    }

    /// A single non-blocking poll, used by `read()` implementations that
    /// need "is anything pending right now" without sleeping.
    pub fn poll_once(&self, out: &mut [libc::kevent]) -> io::Result<usize> {
        self.wait(out, Some(Duration::from_secs(0)))
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "Selector(id={}, fd={})", self.id, self.kq.as_raw_fd())
    }
}
