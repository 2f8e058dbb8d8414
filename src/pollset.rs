//! The polling set (spec §4.1): a registration table plus the translation
//! and synthesis rules that make a kqueue look like Linux `epoll` to a
//! caller.
//!
//! # Shape of the thing
//!
//! Every registration tracks, per observed descriptor: the mask the caller
//! asked for, the arming mode, a cookie, and which kqueue filters are
//! currently installed. `control` turns a request into a batch of
//! `EV_ADD`/`EV_DELETE` changes; `wait` turns a batch of raw `kevent`s back
//! into Linux-shaped [`Event`]s, merging multiple filters that fired for the
//! same descriptor into the single event Linux would have reported.

use crate::epoll::{EpollOpt, Event, Events, Ready, Token};
use crate::registry::{self, Kind as RegistryKind};
use crate::sigset::SigSet;
use crate::sys::kqueue::Selector;

use indexmap::IndexMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Implementation ceiling on events-per-wait; matches the reference
/// shim's `MAX_KEVENTS`.
const MAX_EVENTS: usize = 1024;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Flags accepted by [`PollSet::new`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateFlags(u32);

impl CreateFlags {
    pub const CLOEXEC: CreateFlags = CreateFlags(1);

    pub fn empty() -> CreateFlags {
        CreateFlags(0)
    }

    fn is_valid(self) -> bool {
        self.0 & !CreateFlags::CLOEXEC.0 == 0
    }

    fn has_cloexec(self) -> bool {
        self.0 & CreateFlags::CLOEXEC.0 != 0
    }
}

impl std::ops::BitOr for CreateFlags {
    type Output = CreateFlags;
    fn bitor(self, rhs: CreateFlags) -> CreateFlags {
        CreateFlags(self.0 | rhs.0)
    }
}

/// `control` operation kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CtlOp {
    Add,
    Modify,
    Remove,
}

/// A registration target: a raw descriptor number, optionally pinned to a
/// specific generation (spec §4.1 "descriptor-identity hazard").
///
/// The bare `RawFd` is not a stable key on its own — the kernel may recycle
/// a descriptor number after the caller closes it without telling this
/// `PollSet` first (via [`PollSet::notify_closed`]). A caller that has
/// cached the generation returned by [`PollSet::generation_of`] can pass
/// `(fd, generation)` so `control` itself rejects a MODIFY/REMOVE that
/// targets a now-stale registration instead of silently operating on
/// whatever happens to currently sit at that fd number. Plain `RawFd`
/// converts with no generation pinned, preserving the old behaviour for
/// callers that don't track generations themselves.
#[derive(Clone, Copy, Debug)]
pub struct Target {
    fd: RawFd,
    generation: Option<u64>,
}

impl From<RawFd> for Target {
    fn from(fd: RawFd) -> Target {
        Target { fd, generation: None }
    }
}

impl From<(RawFd, u64)> for Target {
    fn from((fd, generation): (RawFd, u64)) -> Target {
        Target {
            fd,
            generation: Some(generation),
        }
    }
}

/// What a caller wants to watch for on a given target descriptor.
///
/// `error` and `hang-up` are never part of this request — per spec they are
/// always implicitly enabled and are not representable as maskable bits.
#[derive(Clone, Copy, Debug)]
pub struct Registration {
    pub interest: Ready,
    pub opts: EpollOpt,
    pub token: Token,
}

/// Kind hint recorded at ADD time, used by the synthesis rules.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TargetKind {
    Socket,
    Pipe,
    Other,
    /// Target is itself one of our descriptors (another `PollSet`, a
    /// `TimerFd`, a `Signalfd`, an `EventCounter`) — observed purely for
    /// readability, per spec's one-level-of-nesting rule.
    Nested,
}

/// Per-registration sticky state (spec §4.1 "state machine per
/// registration"). `Inactive` has no representation here: it is simply the
/// absence of a table entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegState {
    Armed,
    Quiescent,
    Errored,
}

#[derive(Clone, Copy, Default, Debug)]
struct Installed {
    read: bool,
    write: bool,
    except: bool,
}

struct Entry {
    interest: Ready,
    opts: EpollOpt,
    token: Token,
    generation: u64,
    kind: TargetKind,
    state: RegState,
    installed: Installed,
    hup_delivered: bool,
    /// True from ADD until the first write-filter event for a not-yet
    /// connected stream socket has been swallowed.
    suppress_initial_write: bool,
}

fn wanted_filters(interest: Ready) -> (bool, bool, bool) {
    let want_priority = interest.is_priority();
    // Spec §4.1: "priority ... install exception filter if the host
    // supports one; else fall back to socket in-band signalling" — without
    // EVFILT_EXCEPT the only portable substitute is SO_OOBINLINE, which
    // folds the out-of-band byte into the ordinary read stream, so the read
    // filter is what has to carry it instead.
    let read = interest.is_readable()
        || interest.is_read_hup()
        || (want_priority && !have_except_filter());
    let write = interest.is_writable();
    let except = want_priority && have_except_filter();
    (read, write, except)
}

#[cfg(target_os = "freebsd")]
fn have_except_filter() -> bool {
    true
}

#[cfg(not(target_os = "freebsd"))]
fn have_except_filter() -> bool {
    false
}

fn base_flags(opts: EpollOpt, add: bool) -> u32 {
    let mut flags: u32 = if add {
        (libc::EV_ADD | libc::EV_ENABLE) as u32
    } else {
        0
    };
    if opts.is_edge() {
        flags |= libc::EV_CLEAR as u32;
    }
    if opts.is_oneshot() {
        flags |= libc::EV_ONESHOT as u32;
    }
    flags
}

fn change(ident: RawFd, filter: i16, flags: u32, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags: flags as _,
        fflags: fflags as _,
        data: 0,
        udata: ident as *mut libc::c_void,
    }
}

/// Reconciles one filter's installed/wanted state, appending an
/// `EV_ADD`/`EV_DELETE` change when the filter's presence or disposition
/// needs to move, and updating `*have` to match.
fn filter_change(
    changes: &mut Vec<libc::kevent>,
    have: &mut bool,
    want: bool,
    target: RawFd,
    filter: i16,
    add_flags: u32,
    fflags: u32,
) {
    if want {
        // Re-assert even when already installed, so a changed edge/oneshot
        // disposition takes effect immediately.
        changes.push(change(target, filter, add_flags, fflags));
        *have = true;
    } else if *have {
        changes.push(change(target, filter, libc::EV_DELETE as u32, 0));
        *have = false;
    }
}

impl Entry {
    fn new(req: Registration, kind: TargetKind, generation: u64, connect_pending: bool) -> Entry {
        Entry {
            interest: req.interest,
            opts: req.opts,
            token: req.token,
            generation,
            kind,
            state: RegState::Armed,
            installed: Installed::default(),
            hup_delivered: false,
            suppress_initial_write: connect_pending,
        }
    }

    /// Build the kevent batch to move `self.installed` to match
    /// `self.interest`/`self.opts`, and update `self.installed` to reflect
    /// the result.
    fn sync_changes(&mut self, target: RawFd) -> Vec<libc::kevent> {
        let (want_read, want_write, want_except) = wanted_filters(self.interest);
        let add_flags = base_flags(self.opts, true);
        let mut changes = Vec::with_capacity(3);

        filter_change(
            &mut changes,
            &mut self.installed.read,
            want_read,
            target,
            libc::EVFILT_READ,
            add_flags,
            0,
        );
        filter_change(
            &mut changes,
            &mut self.installed.write,
            want_write,
            target,
            libc::EVFILT_WRITE,
            add_flags,
            0,
        );
        #[cfg(target_os = "freebsd")]
        filter_change(
            &mut changes,
            &mut self.installed.except,
            want_except,
            target,
            libc::EVFILT_EXCEPT,
            add_flags,
            libc::NOTE_OOB as u32,
        );
        #[cfg(not(target_os = "freebsd"))]
        let _ = want_except;

        changes
    }

    fn teardown_changes(&self, target: RawFd) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(3);
        if self.installed.read {
            changes.push(change(target, libc::EVFILT_READ, libc::EV_DELETE as u32, 0));
        }
        if self.installed.write {
            changes.push(change(target, libc::EVFILT_WRITE, libc::EV_DELETE as u32, 0));
        }
        #[cfg(target_os = "freebsd")]
        if self.installed.except {
            changes.push(change(target, libc::EVFILT_EXCEPT, libc::EV_DELETE as u32, 0));
        }
        changes
    }
}

/// A kqueue-backed stand-in for Linux `epoll`.
pub struct PollSet {
    selector: Selector,
    table: Mutex<IndexMap<RawFd, Entry>>,
}

impl PollSet {
    pub fn new(flags: CreateFlags) -> io::Result<PollSet> {
        if !flags.is_valid() {
            return Err(invalid_argument());
        }

        let selector = Selector::new()?;
        if flags.has_cloexec() {
            syscall!(fcntl(selector.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        }

        registry::register(selector.as_raw_fd(), RegistryKind::PollSet);

        Ok(PollSet {
            selector,
            table: Mutex::new(IndexMap::new()),
        })
    }

    /// Add, modify, or remove a registration.
    ///
    /// `target` accepts a plain `RawFd` or a `(RawFd, generation)` pair (see
    /// [`Target`]); a pinned generation that doesn't match the table's live
    /// entry is treated the same as a closed descriptor (*bad-descriptor*),
    /// since it means the number has already been recycled out from under
    /// the caller's last-known registration (spec §4.1 "descriptor-identity
    /// hazard").
    ///
    /// Error precedence matches spec §4.1: target-validity checks run
    /// before the null-request check, so a structurally bad target always
    /// wins over "you forgot to pass a request" — see spec §8's boundary
    /// behaviour ("closed target + non-null request" example).
    pub fn control(
        &self,
        op: CtlOp,
        target: impl Into<Target>,
        request: Option<Registration>,
    ) -> io::Result<()> {
        let target = target.into();
        let fd = target.fd;

        if fd == self.selector.as_raw_fd() || fd < 0 {
            return Err(invalid_argument());
        }
        if !target_is_open(fd) {
            return Err(bad_descriptor());
        }
        if op != CtlOp::Remove && request.is_none() {
            return Err(fault());
        }

        let mut table = self.table.lock().unwrap();

        // A pinned generation that no longer matches the live entry means
        // the caller's last-known registration at this fd number is stale —
        // the kernel has since recycled the number. Reject MODIFY/REMOVE
        // against it as a bad descriptor rather than operating on (or
        // tearing down) whatever registration actually lives there now.
        if op != CtlOp::Add {
            if let Some(expected) = target.generation {
                match table.get(&fd) {
                    Some(entry) if entry.generation == expected => {}
                    _ => return Err(bad_descriptor()),
                }
            }
        }

        match op {
            CtlOp::Add => {
                if table.contains_key(&fd) {
                    return Err(already_exists());
                }
                let req = request.unwrap();
                let kind = target_kind(fd);
                let connect_pending = kind == TargetKind::Socket && !is_connected(fd);
                if kind == TargetKind::Socket && req.interest.is_priority() && !have_except_filter() {
                    let _ = enable_oobinline(fd);
                }
                let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
                let mut entry = Entry::new(req, kind, generation, connect_pending);
                let changes = entry.sync_changes(fd);
                self.selector.submit(&changes)?;
                table.insert(fd, entry);
                log::trace!("pollset: add {:?} interest={:?}", fd, req.interest);
                Ok(())
            }
            CtlOp::Modify => {
                let entry = table.get_mut(&fd).ok_or_else(no_such_entry)?;
                let req = request.unwrap();
                entry.interest = req.interest;
                entry.opts = req.opts;
                entry.token = req.token;
                if entry.state == RegState::Quiescent {
                    entry.state = RegState::Armed;
                }
                let changes = entry.sync_changes(fd);
                self.selector.submit(&changes)?;
                log::trace!("pollset: modify {:?} interest={:?}", fd, req.interest);
                Ok(())
            }
            CtlOp::Remove => {
                let entry = table.shift_remove(&fd).ok_or_else(no_such_entry)?;
                for ch in entry.teardown_changes(fd) {
                    self.selector.apply(ch, true)?;
                }
                log::trace!("pollset: remove {:?}", fd);
                Ok(())
            }
        }
    }

    /// Drop a stale registration without touching the kqueue, because the
    /// fd has already been closed at the host level (the kernel has
    /// already discarded any filters on it). This is the integration point
    /// the external call-interception layer (spec §4.3) is expected to call
    /// on an intercepted `close`, so this polling set never mistakes a
    /// reused descriptor number for the closed one (spec §4.1's
    /// descriptor-identity hazard).
    pub fn notify_closed(&self, target: RawFd) {
        let mut table = self.table.lock().unwrap();
        if table.shift_remove(&target).is_some() {
            log::trace!("pollset: {:?} dropped on notify_closed", target);
        }
    }

    /// The generation stamped on `target`'s current registration, if any.
    ///
    /// An interception layer that keeps its own table of open descriptor
    /// numbers can cache this at ADD time and pass it back as `(fd,
    /// generation).into()` to a later MODIFY/REMOVE's `target` argument, so
    /// [`PollSet::control`] itself rejects the call as *bad-descriptor* if
    /// the number has been recycled in between, instead of the caller
    /// needing to detect the reuse hazard (spec §4.1) on its own.
    pub fn generation_of(&self, target: RawFd) -> Option<u64> {
        self.table.lock().unwrap().get(&target).map(|e| e.generation)
    }

    /// Block for ready events, writing up to `max` into `out`.
    pub fn wait(
        &self,
        out: &mut Events,
        max: usize,
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> io::Result<usize> {
        if max == 0 || max > MAX_EVENTS {
            return Err(invalid_argument());
        }

        out.clear();

        let _guard = sigmask.map(SigMaskGuard::install).transpose()?;

        // A single target can produce up to three raw kevents (read, write,
        // except) that must coalesce into one reported event, so the raw
        // buffer is oversized relative to `max`.
        let raw_cap = (max * 3).min(MAX_EVENTS * 3);
        let mut raw = vec![zeroed_kevent(); raw_cap];

        let n = self.selector.wait(&mut raw, timeout)?;

        let mut table = self.table.lock().unwrap();
        let mut merged: IndexMap<RawFd, Ready> = IndexMap::new();

        for kev in &raw[..n] {
            let fd = kev.udata as usize as RawFd;
            let Some(entry) = table.get_mut(&fd) else {
                continue;
            };

            if entry.state == RegState::Errored {
                continue;
            }

            let ready = match synthesize(entry, fd, kev) {
                Some(r) => r,
                None => continue,
            };

            if entry.opts.is_oneshot() {
                entry.state = RegState::Quiescent;
                entry.installed = Installed::default();
            }

            *merged.entry(fd).or_insert_with(Ready::empty) |= ready;
        }

        let mut count = 0;
        for (fd, ready) in merged {
            if count >= max {
                break;
            }
            let token = table.get(&fd).map(|e| e.token).unwrap_or(Token(0));
            out.push(Event::new(ready, token));
            count += 1;
        }

        Ok(count)
    }
}

impl AsRawFd for PollSet {
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}

impl Drop for PollSet {
    fn drop(&mut self) {
        registry::unregister(self.selector.as_raw_fd());
    }
}

/// Map one raw kevent to the Linux readiness bits it represents, per spec
/// §4.1's synthesis rules. Returns `None` when the event should be
/// swallowed entirely (the connecting-socket spurious-writable suppression).
fn synthesize(entry: &mut Entry, target: RawFd, kev: &libc::kevent) -> Option<Ready> {
    let eof = (kev.flags as u32) & (libc::EV_EOF as u32) != 0;

    match kev.filter {
        libc::EVFILT_READ => {
            let mut ready = Ready::empty();
            if eof {
                entry.hup_delivered = true;
                ready.insert(Ready::hup());
                if entry.kind == TargetKind::Socket && entry.interest.is_read_hup() {
                    ready.insert(Ready::read_hup());
                }
                if kev.data > 0 {
                    ready.insert(Ready::readable());
                }
            } else {
                ready.insert(Ready::readable());
            }
            Some(ready)
        }
        libc::EVFILT_WRITE => {
            if eof {
                // A genuine EOF/error event must never be swallowed, even as
                // the very first event this registration ever sees (the
                // realistic connect-then-wait ordering with no intervening
                // wait() to clear the suppression flag first). Only a clean,
                // non-EOF writable notification is eligible for suppression.
                entry.suppress_initial_write = false;
                let mut ready = Ready::writable() | Ready::hup();
                entry.hup_delivered = true;
                if socket_error(target).unwrap_or(0) != 0 {
                    ready.insert(Ready::error());
                    entry.state = RegState::Errored;
                }
                Some(ready)
            } else if entry.suppress_initial_write {
                entry.suppress_initial_write = false;
                None
            } else {
                Some(Ready::writable())
            }
        }
        #[cfg(target_os = "freebsd")]
        f if f == libc::EVFILT_EXCEPT => Some(Ready::priority()),
        _ => None,
    }
}

fn zeroed_kevent() -> libc::kevent {
    unsafe { std::mem::zeroed() }
}

fn target_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn target_kind(fd: RawFd) -> TargetKind {
    if registry::kind_of(fd).is_some() {
        return TargetKind::Nested;
    }

    let mut st = MaybeUninit::<libc::stat>::uninit();
    let kind = unsafe {
        if libc::fstat(fd, st.as_mut_ptr()) != 0 {
            return TargetKind::Other;
        }
        let st = st.assume_init();
        match st.st_mode as libc::mode_t & libc::S_IFMT {
            libc::S_IFSOCK => TargetKind::Socket,
            libc::S_IFIFO => TargetKind::Pipe,
            _ => TargetKind::Other,
        }
    };
    kind
}

/// Whether `fd` (assumed to be a socket) is already connected — used to
/// detect the freshly-created, not-yet-connected case that needs the
/// first spurious write-filter event suppressed.
fn is_connected(fd: RawFd) -> bool {
    let mut addr = MaybeUninit::<libc::sockaddr_storage>::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    unsafe { libc::getpeername(fd, addr.as_mut_ptr() as *mut libc::sockaddr, &mut len) == 0 }
}

fn enable_oobinline(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_OOBINLINE,
        &one as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}

fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(err)
}

/// Installs a signal mask for the duration of a `wait`, restoring the
/// previous mask on drop (covers early returns and errors alike).
struct SigMaskGuard {
    old: libc::sigset_t,
}

impl SigMaskGuard {
    fn install(mask: &SigSet) -> io::Result<SigMaskGuard> {
        let mut old = unsafe { std::mem::zeroed() };
        syscall!(pthread_sigmask(libc::SIG_SETMASK, mask.as_raw(), &mut old))?;
        Ok(SigMaskGuard { old })
    }
}

impl Drop for SigMaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

fn invalid_argument() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn fault() -> io::Error {
    io::Error::from_raw_os_error(libc::EFAULT)
}

fn already_exists() -> io::Error {
    io::Error::from_raw_os_error(libc::EEXIST)
}

fn no_such_entry() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_flags_reject_unknown_bits() {
        let bogus = CreateFlags(0x8000_0000);
        assert!(!bogus.is_valid());
        assert!(CreateFlags::empty().is_valid());
        assert!(CreateFlags::CLOEXEC.is_valid());
    }

    #[test]
    fn wanted_filters_maps_read_hup_to_read_filter() {
        let (read, write, except) = wanted_filters(Ready::read_hup());
        assert!(read);
        assert!(!write);
        assert!(!except);
    }

    #[test]
    fn wanted_filters_priority_without_except_support_installs_nothing() {
        if have_except_filter() {
            return;
        }
        let (_, _, except) = wanted_filters(Ready::priority());
        assert!(!except);
    }
}
