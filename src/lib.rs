//! Linux readiness-notification and auxiliary event descriptors, emulated on
//! top of BSD `kqueue` and POSIX realtime timers.
//!
//! This crate targets kernels that expose `kqueue(2)` and `timer_create`
//! with `SIGEV_THREAD_ID` but no native `epoll`/`timerfd`/`signalfd`
//! (FreeBSD and DragonFly BSD). It is a building block for a call-
//! interception layer, not one itself: something upstream of this crate is
//! expected to route an intercepted `close`/`read`/`write` on one of our
//! descriptors to the matching method here (see [`registry`] for the table
//! that routing would consult).
//!
//! The two pieces that carry the real engineering are [`pollset::PollSet`]
//! (translates a single level-or-edge-triggered Linux event mask to and from
//! a kqueue's per-filter model, synthesising events the kernel doesn't
//! natively report — peer-close, hang-up, connect failure) and
//! [`timer::TimerFd`] (a state machine that upgrades from a cheap
//! kqueue-hosted timer filter to a helper-thread-backed POSIX realtime timer
//! exactly when the simple form can't express the request). [`signalfd`] and
//! [`eventcounter`] round out the descriptor families Linux exposes
//! alongside `epoll`/`timerfd`, implemented as thin wrappers.
//!
//! # Example
//!
//! ```no_run
//! use epoll_compat::{CreateFlags, CtlOp, EpollOpt, Events, PollSet, Ready, Registration, Token};
//! use std::os::unix::io::AsRawFd;
//! use std::time::Duration;
//!
//! # fn try_main() -> std::io::Result<()> {
//! let pollset = PollSet::new(CreateFlags::empty())?;
//! let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
//!
//! pollset.control(
//!     CtlOp::Add,
//!     listener.as_raw_fd(),
//!     Some(Registration {
//!         interest: Ready::readable(),
//!         opts: EpollOpt::edge(),
//!         token: Token(1),
//!     }),
//! )?;
//!
//! let mut events = Events::with_capacity(16);
//! pollset.wait(&mut events, 16, Some(Duration::from_millis(100)), None)?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

mod sys;

pub mod epoll;
pub mod eventcounter;
pub mod pollset;
pub mod registry;
pub mod signalfd;
mod sigset;
pub mod timer;

pub use epoll::{EpollOpt, Event, Events, Ready, Token};
pub use eventcounter::EventCounter;
pub use pollset::{CreateFlags, CtlOp, PollSet, Registration, Target};
pub use signalfd::{SignalInfo, Signalfd};
pub use sigset::SigSet;
pub use timer::{ArmFlags, Clock, TimerFd, TimerSpec};
