//! Linux-shaped readiness types (`Token`, `Ready`, `EpollOpt`, `Event`,
//! `Events`) shared by [`crate::pollset::PollSet`] and the descriptor kinds
//! that register with it.
//!
//! These are split out from `pollset` because they carry no kqueue state of
//! their own — they're plain value types, matched against Linux's
//! `epoll_event` bit layout so a caller porting code from Linux sees the
//! same numbers back.

mod epoll_opt;
mod event;
mod ready;
mod token;

pub use epoll_opt::EpollOpt;
pub use event::{Event, Events, Iter};
pub use ready::Ready;
pub use token::Token;
