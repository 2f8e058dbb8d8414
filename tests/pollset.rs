//! Live-kqueue scenarios from spec §8 "Concrete scenarios". Requires a real
//! kqueue, so this whole file is gated to the target OS family.
#![cfg(any(target_os = "freebsd", target_os = "dragonfly"))]

use epoll_compat::{CreateFlags, CtlOp, EpollOpt, Events, PollSet, Ready, Registration, Token};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::try_init();
    });
}

fn make_pipe() -> (std::fs::File, std::fs::File) {
    use std::os::unix::io::FromRawFd;

    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
}

#[test]
fn simple_readable() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let (r, mut w) = make_pipe();

    pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(7),
            }),
        )
        .unwrap();

    w.write_all(b"x").unwrap();

    let mut events = Events::with_capacity(4);
    let n = pollset.wait(&mut events, 4, Some(Duration::from_secs(1)), None).unwrap();
    assert_eq!(n, 1);
    let ev = events.get(0).unwrap();
    assert!(ev.readiness().is_readable());
    assert_eq!(ev.token(), Token(7));
}

#[test]
fn peer_close_with_residual_bytes() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let (mut r, mut w) = make_pipe();

    pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(1),
            }),
        )
        .unwrap();

    w.write_all(b"x").unwrap();
    drop(w);

    let mut events = Events::with_capacity(4);
    pollset.wait(&mut events, 4, Some(Duration::from_secs(1)), None).unwrap();
    let ev = events.get(0).unwrap();
    assert!(ev.readiness().is_readable());
    assert!(ev.readiness().is_hup());

    let mut buf = [0u8; 1];
    std::io::Read::read_exact(&mut r, &mut buf).unwrap();

    events.get(0);
    let mut events2 = Events::with_capacity(4);
    let n = pollset
        .wait(&mut events2, 4, Some(Duration::from_millis(200)), None)
        .unwrap();
    assert_eq!(n, 1);
    let ev = events2.get(0).unwrap();
    assert!(!ev.readiness().is_readable());
    assert!(ev.readiness().is_hup());
}

#[test]
fn add_existing_with_changed_cookie_keeps_original() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let (r, mut w) = make_pipe();

    pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(42),
            }),
        )
        .unwrap();

    let err = pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(43),
            }),
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

    w.write_all(b"x").unwrap();
    let mut events = Events::with_capacity(4);
    pollset.wait(&mut events, 4, Some(Duration::from_secs(1)), None).unwrap();
    assert_eq!(events.get(0).unwrap().token(), Token(42));
}

#[test]
fn wait_rejects_zero_max() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let mut events = Events::with_capacity(4);
    let err = pollset.wait(&mut events, 0, Some(Duration::from_millis(1)), None).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn remove_then_wait_never_reports_again() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let (r, mut w) = make_pipe();

    pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(1),
            }),
        )
        .unwrap();
    w.write_all(b"x").unwrap();

    pollset.control(CtlOp::Remove, r.as_raw_fd(), None).unwrap();

    let mut events = Events::with_capacity(4);
    let n = pollset
        .wait(&mut events, 4, Some(Duration::from_millis(100)), None)
        .unwrap();
    assert_eq!(n, 0);
}

#[test]
fn control_with_stale_generation_is_rejected_as_bad_descriptor() {
    init_logging();
    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let (r, _w) = make_pipe();

    pollset
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(1),
            }),
        )
        .unwrap();

    let live = pollset.generation_of(r.as_raw_fd()).unwrap();
    let stale = live.wrapping_sub(1);

    let err = pollset
        .control(CtlOp::Remove, (r.as_raw_fd(), stale), None)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));

    let err = pollset
        .control(
            CtlOp::Modify,
            (r.as_raw_fd(), stale),
            Some(Registration {
                interest: Ready::writable(),
                opts: EpollOpt::level(),
                token: Token(2),
            }),
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));

    // The registration itself is untouched by the rejected calls above.
    assert_eq!(pollset.generation_of(r.as_raw_fd()), Some(live));

    // The correct generation still works.
    pollset.control(CtlOp::Remove, (r.as_raw_fd(), live), None).unwrap();
    assert_eq!(pollset.generation_of(r.as_raw_fd()), None);
}

#[test]
fn connecting_socket_reports_writable_error_hup_on_failure() {
    init_logging();
    // Connect to a listener we immediately drop, so the handshake fails
    // with a reset rather than just timing out.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    let sock = TcpStream::connect(addr);
    // Connection may fail synchronously on some platforms; only proceed if
    // we got a socket to register (the async connect-refused path is what
    // this test is after).
    let sock = match sock {
        Ok(s) => s,
        Err(_) => return,
    };
    sock.set_nonblocking(true).unwrap();

    pollset
        .control(
            CtlOp::Add,
            sock.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable() | Ready::writable() | Ready::read_hup(),
                opts: EpollOpt::level(),
                token: Token(9),
            }),
        )
        .unwrap();

    let mut events = Events::with_capacity(4);
    let mut n = 0;
    for _ in 0..3 {
        n = pollset
            .wait(&mut events, 4, Some(Duration::from_secs(2)), None)
            .unwrap();
        if n > 0 {
            break;
        }
    }
    assert!(n >= 1, "expected a writable/error/hup event after connect failure");
    let ev = events.get(0).unwrap();
    assert!(ev.readiness().is_writable());
    assert!(ev.readiness().is_hup());
}

#[test]
fn nested_pollset_observed_as_readable() {
    init_logging();
    let inner = PollSet::new(CreateFlags::empty()).unwrap();
    let outer = PollSet::new(CreateFlags::empty()).unwrap();
    let (r, mut w) = make_pipe();

    inner
        .control(
            CtlOp::Add,
            r.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(1),
            }),
        )
        .unwrap();

    outer
        .control(
            CtlOp::Add,
            inner.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable(),
                opts: EpollOpt::level(),
                token: Token(99),
            }),
        )
        .unwrap();

    w.write_all(b"x").unwrap();

    let mut events = Events::with_capacity(4);
    let n = outer
        .wait(&mut events, 4, Some(Duration::from_secs(1)), None)
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(events.get(0).unwrap().token(), Token(99));
}

#[test]
fn unix_socket_hangup_on_peer_shutdown() {
    init_logging();
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let pollset = PollSet::new(CreateFlags::empty()).unwrap();
    pollset
        .control(
            CtlOp::Add,
            a.as_raw_fd(),
            Some(Registration {
                interest: Ready::readable() | Ready::read_hup(),
                opts: EpollOpt::level(),
                token: Token(5),
            }),
        )
        .unwrap();

    drop(b);

    let mut events = Events::with_capacity(4);
    let n = pollset
        .wait(&mut events, 4, Some(Duration::from_secs(1)), None)
        .unwrap();
    assert_eq!(n, 1);
    assert!(events.get(0).unwrap().readiness().is_hup());
}
