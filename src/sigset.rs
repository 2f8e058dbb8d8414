use std::io;
use std::mem::MaybeUninit;

/// Thin wrapper around `sigset_t`, used by [`crate::pollset::PollSet::wait`]
/// (the optional signal mask argument) and [`crate::signalfd::Signalfd`].
#[derive(Clone, Copy)]
pub struct SigSet(libc::sigset_t);

impl SigSet {
    pub fn empty() -> io::Result<SigSet> {
        let mut set = MaybeUninit::uninit();
        syscall!(sigemptyset(set.as_mut_ptr()))?;
        Ok(SigSet(unsafe { set.assume_init() }))
    }

    pub fn full() -> io::Result<SigSet> {
        let mut set = MaybeUninit::uninit();
        syscall!(sigfillset(set.as_mut_ptr()))?;
        Ok(SigSet(unsafe { set.assume_init() }))
    }

    pub fn add(&mut self, signum: i32) -> io::Result<()> {
        syscall!(sigaddset(&mut self.0, signum))?;
        Ok(())
    }

    pub fn contains(&self, signum: i32) -> io::Result<bool> {
        let ret = syscall!(sigismember(&self.0, signum))?;
        Ok(ret != 0)
    }

    pub(crate) fn as_raw(&self) -> &libc::sigset_t {
        &self.0
    }
}
