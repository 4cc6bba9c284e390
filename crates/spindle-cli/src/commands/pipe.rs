//! `spindle pipe`: two fibers bouncing a counter over nonblocking pipes.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam::channel;
use spindle::{Event, IoManager};

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn send(fd: RawFd, value: u32) -> io::Result<()> {
    let bytes = value.to_ne_bytes();
    // SAFETY: `bytes` is valid for `bytes.len()` bytes.
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if n as usize != bytes.len() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read one value, parking the calling fiber while the pipe is empty
fn recv(io: &IoManager, fd: RawFd) -> anyhow::Result<u32> {
    let mut bytes = [0u8; 4];
    loop {
        // SAFETY: `bytes` is valid for writes of `bytes.len()` bytes.
        let n = unsafe { libc::read(fd, bytes.as_mut_ptr() as *mut libc::c_void, bytes.len()) };
        if n as usize == bytes.len() {
            return Ok(u32::from_ne_bytes(bytes));
        }
        let err = io::Error::last_os_error();
        if n >= 0 || err.kind() != io::ErrorKind::WouldBlock {
            return Err(err).context("reading from pipe");
        }
        io.wait_event(fd, Event::Read)?;
    }
}

pub fn execute(rounds: u32, threads: usize) -> anyhow::Result<()> {
    let io = IoManager::new(threads, false, "pipe").context("creating reactor")?;
    let (ping_r, ping_w) = nonblocking_pipe().context("creating ping pipe")?;
    let (pong_r, pong_w) = nonblocking_pipe().context("creating pong pipe")?;
    let ping_r = Arc::new(ping_r);
    let pong_w = Arc::new(pong_w);
    let (result_tx, result_rx) = channel::bounded::<anyhow::Result<u32>>(2);

    let echo_tx = result_tx.clone();
    io.schedule(move || {
        let run = || -> anyhow::Result<u32> {
            let io = IoManager::current().context("echo fiber is not on a reactor")?;
            for _ in 0..rounds {
                let v = recv(&io, ping_r.as_raw_fd())?;
                send(pong_w.as_raw_fd(), v + 1)?;
            }
            Ok(rounds)
        };
        let _ = echo_tx.send(run());
    });

    let started = Instant::now();
    io.schedule(move || {
        let run = || -> anyhow::Result<u32> {
            let io = IoManager::current().context("driver fiber is not on a reactor")?;
            let mut value = 0;
            for _ in 0..rounds {
                send(ping_w.as_raw_fd(), value)?;
                value = recv(&io, pong_r.as_raw_fd())?;
            }
            Ok(value)
        };
        let _ = result_tx.send(run());
    });

    let mut outcomes = Vec::with_capacity(2);
    for _ in 0..2 {
        match result_rx.recv_timeout(Duration::from_secs(30)) {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => {
                // A fiber is stuck on a pipe; stop() would wait for it forever.
                anyhow::bail!("pipe fibers did not finish within 30s");
            }
        }
    }
    let elapsed = started.elapsed();
    io.stop();

    for outcome in outcomes {
        let value = outcome?;
        anyhow::ensure!(value == rounds, "expected {} round trips, counted {}", rounds, value);
    }
    println!(
        "{} round trips in {:?} ({:.0} ns each)",
        rounds,
        elapsed,
        elapsed.as_nanos() as f64 / rounds.max(1) as f64
    );
    Ok(())
}
