/// Opaque user cookie carried from a registration through to the events it
/// produces.
///
/// Linux's `epoll_data_t` is a union big enough for a `u64`, a pointer, or
/// two `u32`s; callers here just get the raw 64 bits back unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

impl From<u64> for Token {
    #[inline]
    fn from(val: u64) -> Token {
        Token(val)
    }
}

impl From<Token> for u64 {
    #[inline]
    fn from(val: Token) -> u64 {
        val.0
    }
}
