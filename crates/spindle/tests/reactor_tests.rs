//! I/O Manager Integration Tests
//!
//! Drives the epoll reactor through its public API:
//! - Fibers blocking on pipe readiness
//! - One-shot and recurring timers firing on worker threads
//! - Shutdown waiting for pending registrations
//!
//! # Running Tests
//! ```bash
//! cargo test --test reactor_tests
//! ```

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use spindle::{Event, IoManager};

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rt, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn write_byte(fd: RawFd, byte: u8) {
    let rt = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
}

/// Read one byte, parking the calling fiber until one is available
fn read_byte(io: &IoManager, fd: RawFd) -> u8 {
    let mut byte = 0u8;
    loop {
        let rt = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if rt == 1 {
            return byte;
        }
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
        io.wait_event(fd, Event::Read).unwrap();
    }
}

// ===== Readiness =====

#[test]
fn test_pipe_ping_pong_between_fibers() {
    init_test_logging();
    let io = IoManager::new(2, false, "ping_pong").unwrap();
    let (ping_r, ping_w) = pipe();
    let (pong_r, pong_w) = pipe();
    let (ping_r, ping_w) = (Arc::new(ping_r), Arc::new(ping_w));
    let (pong_r, pong_w) = (Arc::new(pong_r), Arc::new(pong_w));
    let (tx, rx) = channel::bounded(1);

    {
        let (ping_r, pong_w) = (ping_r.clone(), pong_w.clone());
        io.schedule(move || {
            let io = IoManager::current().expect("on a worker");
            for _ in 0..10 {
                let b = read_byte(&io, ping_r.as_raw_fd());
                write_byte(pong_w.as_raw_fd(), b + 1);
            }
        });
    }
    {
        let (pong_r, ping_w) = (pong_r.clone(), ping_w.clone());
        io.schedule(move || {
            let io = IoManager::current().expect("on a worker");
            let mut value = 0u8;
            for _ in 0..10 {
                write_byte(ping_w.as_raw_fd(), value);
                value = read_byte(&io, pong_r.as_raw_fd());
            }
            tx.send(value).unwrap();
        });
    }

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 10);
    io.stop();
    assert_eq!(io.pending_events(), 0);
}

#[test]
fn test_write_readiness_fires_immediately() {
    let io = IoManager::new(1, false, "writable").unwrap();
    let (_r, w) = pipe();
    let (tx, rx) = channel::bounded(1);

    io.add_event(w.as_raw_fd(), Event::Write, move || tx.send(()).unwrap())
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    io.stop();
}

#[test]
fn test_schedule_wakes_idle_worker_promptly() {
    let io = IoManager::new(1, false, "wakeup").unwrap();
    let (tx, rx) = channel::bounded(1);
    for round in 0..200 {
        let tx = tx.clone();
        io.schedule(move || tx.send(round).unwrap());
        // Well under the epoll timeout, so a lost tickle shows up here.
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), round);
    }
    io.stop();
}

#[test]
fn test_stop_waits_for_pending_event() {
    let io = IoManager::new(1, false, "pending").unwrap();
    let (r, w) = pipe();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event(r.as_raw_fd(), Event::Read, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        write_byte(w.as_raw_fd(), 1);
        w
    });

    // stop() cannot return while the registration is outstanding.
    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(writer.join().unwrap());
}

// ===== Timers =====

#[test]
fn test_one_shot_and_recurring_timers() {
    init_test_logging();
    let io = IoManager::new(2, false, "timers").unwrap();
    let once = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));

    let o = once.clone();
    io.add_timer(
        100,
        move || {
            o.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    let t = ticks.clone();
    let recurring = io.add_timer(
        50,
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    thread::sleep(Duration::from_millis(230));
    assert!(recurring.cancel());
    assert!(!recurring.cancel());

    io.stop();
    assert_eq!(once.load(Ordering::SeqCst), 1);
    let ticks = ticks.load(Ordering::SeqCst);
    assert!((2..=5).contains(&ticks), "recurring timer fired {ticks} times");
}

#[test]
fn test_timer_delay_is_respected() {
    let io = IoManager::new(1, false, "delay").unwrap();
    let (tx, rx) = channel::bounded(1);
    let started = Instant::now();
    io.add_timer(
        80,
        move || {
            let _ = tx.try_send(Instant::now());
        },
        false,
    );

    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired_at.duration_since(started) >= Duration::from_millis(75));
    io.stop();
}

#[test]
fn test_condition_timer_skipped_when_owner_dropped() {
    let io = IoManager::new(1, false, "condition").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let owner = Arc::new(());
    let f = fired.clone();
    io.add_condition_timer(
        20,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&owner),
        false,
    );
    drop(owner);

    thread::sleep(Duration::from_millis(80));
    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_waits_for_one_shot_timer() {
    let io = IoManager::new(1, false, "drain_timers").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_timer(
        60,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!io.has_timer());
}
