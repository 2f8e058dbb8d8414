//! Live-kqueue / POSIX-realtime-timer scenarios from spec §8. Requires a
//! real kqueue and `timer_create`, so this whole file is gated to the
//! target OS family.
#![cfg(any(target_os = "freebsd", target_os = "dragonfly"))]

use epoll_compat::{ArmFlags, Clock, TimerFd, TimerSpec};
use std::thread::sleep;
use std::time::Duration;

fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::try_init();
    });
}

#[test]
fn simple_one_shot_fires_once() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    timer
        .arm(
            ArmFlags::empty(),
            TimerSpec {
                interval: Duration::ZERO,
                value: Duration::from_millis(100),
            },
            None,
        )
        .unwrap();

    sleep(Duration::from_millis(150));
    assert_eq!(timer.read().unwrap(), 1);

    let err = timer.read().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
}

#[test]
fn zero_spec_disarms() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    timer
        .arm(
            ArmFlags::empty(),
            TimerSpec {
                interval: Duration::ZERO,
                value: Duration::from_millis(50),
            },
            None,
        )
        .unwrap();

    timer.arm(ArmFlags::empty(), TimerSpec::default(), None).unwrap();

    sleep(Duration::from_millis(100));
    let err = timer.read().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
}

#[test]
fn disarm_on_uninitialised_is_a_no_op() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    timer.arm(ArmFlags::empty(), TimerSpec::default(), None).unwrap();
}

#[test]
fn overflow_on_huge_initial_delay() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    let huge = Duration::from_secs(u64::MAX / 1000);
    let err = timer
        .arm(
            ArmFlags::empty(),
            TimerSpec {
                interval: Duration::ZERO,
                value: huge,
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EOVERFLOW));
}

#[test]
fn periodic_with_mismatched_interval_upgrades_and_accumulates() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    timer
        .arm(
            ArmFlags::empty(),
            TimerSpec {
                interval: Duration::from_millis(100),
                value: Duration::from_millis(10),
            },
            None,
        )
        .unwrap();

    sleep(Duration::from_millis(350));

    let mut total = 0u64;
    loop {
        match timer.read() {
            Ok(n) => total += n,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(total >= 3, "expected at least 3 expirations, got {total}");
}

#[test]
fn realtime_clock_forces_complex_state_immediately() {
    init_logging();
    let timer = TimerFd::new(Clock::Realtime).unwrap();
    timer
        .arm(
            ArmFlags::empty(),
            TimerSpec {
                interval: Duration::from_millis(100),
                value: Duration::from_millis(100),
            },
            None,
        )
        .unwrap();

    sleep(Duration::from_millis(250));
    let n = timer.read().unwrap();
    assert!(n >= 1);
}

#[test]
fn gettime_reports_previously_armed_spec() {
    init_logging();
    let timer = TimerFd::new(Clock::Monotonic).unwrap();
    let spec = TimerSpec {
        interval: Duration::ZERO,
        value: Duration::from_millis(500),
    };
    timer.arm(ArmFlags::empty(), spec, None).unwrap();
    assert_eq!(timer.gettime(), spec);
}
