//! Platform glue. Everything here is gated to the BSD family that actually
//! has both kqueue and the POSIX realtime timer API this crate needs
//! (`timer_create` with `SIGEV_THREAD_ID`, `sigwaitinfo`): FreeBSD and
//! DragonFly BSD, matching the reference `epoll-shim` implementation this
//! crate's timer state machine is ported from.

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub mod kqueue;
