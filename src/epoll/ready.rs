use std::{fmt, ops};

/// A set of readiness bits, using Linux's `epoll_event.events` numbering so
/// that a value formatted or transmuted here matches what a real Linux
/// `epoll_wait` would have produced.
///
/// Only `readable` and `writable` are guaranteed on every backend; `error`,
/// `hup`, `rdhup` and `priority` are synthesised by the polling set (see
/// [`crate::pollset`]) and should be treated as hints, same as on Linux.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(u32);

const READABLE: u32 = 0x001; // EPOLLIN
const PRIORITY: u32 = 0x002; // EPOLLPRI
const WRITABLE: u32 = 0x004; // EPOLLOUT
const ERROR: u32 = 0x008; // EPOLLERR
const HUP: u32 = 0x010; // EPOLLHUP
const RDHUP: u32 = 0x2000; // EPOLLRDHUP
const READY_ALL: u32 = READABLE | PRIORITY | WRITABLE | ERROR | HUP | RDHUP;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn priority() -> Ready {
        Ready(PRIORITY)
    }

    /// A stream peer has closed (or shut down) its writing half while the
    /// reading half is still being watched. Linux's `EPOLLRDHUP`.
    #[inline]
    pub fn read_hup() -> Ready {
        Ready(RDHUP)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Hang-up: the descriptor can no longer make progress in either
    /// direction. Always implicitly watched, per spec.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_priority(&self) -> bool {
        self.contains(Ready::priority())
    }

    #[inline]
    pub fn is_read_hup(&self) -> bool {
        self.contains(Ready::read_hup())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<u32> for Ready {
    fn from(bits: u32) -> Ready {
        Ready(bits & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::priority(), "Priority"),
            (Ready::read_hup(), "ReadHup"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")
    }
}
