/// Calls a raw libc function, turning a `-1` return into the last OS error.
///
/// ```ignore
/// let fd = syscall!(kqueue())?;
/// ```
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
