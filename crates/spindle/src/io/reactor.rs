//! IoManager: scheduler + timer set + epoll reactor

use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::fd::FdContext;
use super::{Event, EventMask};
use crate::config::RuntimeConfig;
use crate::error::{contract, contract_violation, RuntimeError, RuntimeResult};
use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{current_driver, Dispatch, Scheduler, Work};
use crate::timer::{Timer, TimerCallback, TimerManager};

const READ_WRITE: u32 = (libc::EPOLLIN | libc::EPOLLOUT) as u32;
const ERROR_HANGUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
const EDGE: u32 = libc::EPOLLET as u32;

/// Scheduler whose idle workers wait in epoll for fd readiness and timers
pub struct IoManager {
    /// Queue, workers and counters
    core: Scheduler,

    /// Timers whose callbacks the reactor schedules on expiry
    timers: TimerManager,

    /// epoll instance
    epoll: OwnedFd,

    /// Read end of the wakeup pipe, registered with epoll
    tickle_read: OwnedFd,

    /// Write end of the wakeup pipe
    tickle_write: OwnedFd,

    /// Registrations that have not fired or been removed
    pending: AtomicUsize,

    /// Per-fd registration records, indexed by fd
    contexts: RwLock<Vec<Arc<FdContext>>>,

    /// Upper bound on one `epoll_wait`, in ms
    max_timeout_ms: u64,

    /// Size of the `epoll_wait` event buffer
    max_events: usize,
}

fn epoll_op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

impl IoManager {
    /// Create an I/O manager and start its workers.
    ///
    /// Arguments are as for [`Scheduler::new`].
    pub fn new(thread_count: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<IoManager>> {
        let config = RuntimeConfig::global();

        // SAFETY: plain syscall; the result is checked before use.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::Reactor(io::Error::last_os_error()));
        }
        // SAFETY: `epfd` is a fresh descriptor nobody else owns.
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut fds = [0 as RawFd; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(RuntimeError::Reactor(io::Error::last_os_error()));
        }
        // SAFETY: both descriptors were just created by pipe2.
        let (tickle_read, tickle_write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32 | EDGE,
            u64: tickle_read.as_raw_fd() as u64,
        };
        // SAFETY: both descriptors are open and `event` is a valid epoll_event.
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_read.as_raw_fd(), &mut event) } != 0 {
            return Err(RuntimeError::Reactor(io::Error::last_os_error()));
        }

        let core = Scheduler::build(thread_count, use_caller, name)?;
        let contexts: Vec<Arc<FdContext>> = (0..config.initial_fd_capacity)
            .map(|fd| FdContext::new(fd as RawFd))
            .collect();

        let manager = Arc::new(IoManager {
            core,
            timers: TimerManager::new(),
            epoll,
            tickle_read,
            tickle_write,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(contexts),
            max_timeout_ms: config.reactor_max_timeout_ms,
            max_events: config.reactor_max_events,
        });

        let weak = Arc::downgrade(&manager);
        manager.timers.on_front_insert(move || {
            if let Some(manager) = weak.upgrade() {
                manager.tickle();
            }
        });

        let driver: Weak<dyn Dispatch> = Arc::downgrade(&manager) as Weak<dyn Dispatch>;
        manager.core.attach(driver);
        if let Err(err) = manager.core.start() {
            manager.core.stop();
            return Err(err);
        }
        Ok(manager)
    }

    /// The I/O manager driving the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        current_driver()?.into_any().downcast::<IoManager>().ok()
    }

    /// The underlying scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.core
    }

    /// The timer set
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Queue a closure for any worker
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.schedule(f);
    }

    /// Queue a suspended fiber
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.core.schedule_fiber(fiber);
    }

    /// Stop the workers once no work, fd registration or timer remains
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Arm a timer; see [`TimerManager::add_timer`]
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(delay_ms, callback, recurring)
    }

    /// Arm a condition timer; see [`TimerManager::add_condition_timer`]
    pub fn add_condition_timer<F, T>(
        &self,
        delay_ms: u64,
        callback: F,
        token: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(delay_ms, callback, token, recurring)
    }

    /// Whether any timer is armed
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Registrations that have neither fired nor been removed
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of fd slots currently allocated
    pub fn fd_capacity(&self) -> usize {
        self.contexts.read().len()
    }

    /// Run `callback` on a worker once `fd` is ready for `event`.
    ///
    /// Registering a kind that is already registered on `fd` is a contract
    /// violation; an `epoll_ctl` failure is returned.
    pub fn add_event<F>(&self, fd: RawFd, event: Event, callback: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Some(Work::callback(callback)))
    }

    /// Resume the calling fiber once `fd` is ready for `event`.
    ///
    /// The caller is expected to yield to hold right after; see
    /// [`IoManager::wait_event`].
    pub fn add_event_resume(&self, fd: RawFd, event: Event) -> RuntimeResult<()> {
        self.register(fd, event, None)
    }

    /// Suspend the calling fiber until `fd` is ready for `event` or the
    /// registration is cancelled.
    pub fn wait_event(&self, fd: RawFd, event: Event) -> RuntimeResult<()> {
        self.register(fd, event, None)?;
        Fiber::yield_to_hold();
        Ok(())
    }

    fn register(&self, fd: RawFd, event: Event, target: Option<Work>) -> RuntimeResult<()> {
        contract!(fd >= 0, "add_event on invalid fd {}", fd);
        let context = self.fd_context_or_grow(fd);
        let mut state = context.state.lock();
        if state.has(event) {
            contract_violation(&format!(
                "{} already registered on fd {} (registered: {})",
                event,
                fd,
                EventMask(state.events)
            ));
        }

        let op = if state.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_ctl(op, fd, EDGE | state.events | event.bits())
            .map_err(|source| RuntimeError::Register { fd, event, source })?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event.bits();

        let scheduler = current_driver()
            .map(|driver| Arc::downgrade(&driver))
            .or_else(|| self.core.driver_weak());
        let target = match target {
            Some(target) => target,
            None => {
                let fiber = Fiber::current();
                contract!(
                    fiber.state() == FiberState::Exec,
                    "fiber {} waiting on fd {} is not executing",
                    fiber.id(),
                    fd
                );
                Work::Fiber(fiber)
            }
        };

        let slot = state.context_mut(event);
        contract!(slot.is_empty(), "stale {} context on fd {}", event, fd);
        slot.scheduler = scheduler;
        slot.target = Some(target);
        Ok(())
    }

    /// Remove a registration without running its target.
    ///
    /// Returns `false` if it was not registered or epoll refused the change.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.fd_context(fd) else {
            return false;
        };
        let mut state = context.state.lock();
        if !state.has(event) {
            return false;
        }

        if self.rearm(fd, state.events & !event.bits()).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        state.clear(event);
        true
    }

    /// Remove a registration and schedule its target immediately.
    ///
    /// Returns `false` if it was not registered or epoll refused the change.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.fd_context(fd) else {
            return false;
        };
        let mut state = context.state.lock();
        if !state.has(event) {
            return false;
        }

        if self.rearm(fd, state.events & !event.bits()).is_err() {
            return false;
        }
        state.trigger(fd, event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Cancel every registration on `fd`, scheduling each target.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(context) = self.fd_context(fd) else {
            return false;
        };
        let mut state = context.state.lock();
        if state.events == 0 {
            return false;
        }

        if self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        for event in Event::ALL {
            if state.has(event) {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        contract!(state.events == 0, "fd {} still has events after cancel_all", fd);
        true
    }

    /// Re-register `fd` with `remaining`, or remove it when nothing remains.
    fn rearm(&self, fd: RawFd, remaining: u32) -> io::Result<()> {
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        self.epoll_ctl(op, fd, EDGE | remaining)
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: the epoll descriptor is owned by `self`; `event` is valid.
        let rt = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(
                epfd = self.epoll.as_raw_fd(),
                op = epoll_op_name(op),
                fd,
                events = %EventMask(events),
                error = %err,
                "epoll_ctl failed"
            );
            return Err(err);
        }
        Ok(())
    }

    fn fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.contexts.read().get(index).cloned()
    }

    fn fd_context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(context) = self.fd_context(fd) {
            return context;
        }
        let index = fd as usize;
        let mut table = self.contexts.write();
        if index >= table.len() {
            let len = (index * 3 / 2).max(index + 1);
            let start = table.len();
            table.extend((start..len).map(|fd| FdContext::new(fd as RawFd)));
        }
        table[index].clone()
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: reading into a local buffer from our own pipe.
            let n = unsafe {
                libc::read(
                    self.tickle_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn stopping_with(&self, next_timeout: u64) -> bool {
        next_timeout == u64::MAX && self.pending_events() == 0 && self.core.can_stop()
    }

    /// Translate one epoll result into triggered registrations.
    fn dispatch_ready(&self, fd: RawFd, mut flags: u32) {
        let Some(context) = self.fd_context(fd) else {
            return;
        };
        let mut state = context.state.lock();
        if flags & ERROR_HANGUP != 0 {
            flags |= READ_WRITE & state.events;
        }
        let fired = flags & READ_WRITE & state.events;
        if fired == 0 {
            return;
        }

        if self.rearm(fd, state.events & !fired).is_err() {
            return;
        }
        for event in Event::ALL {
            if fired & event.bits() != 0 {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Dispatch for IoManager {
    fn core(&self) -> &Scheduler {
        &self.core
    }

    fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        tracing::trace!(scheduler = %self.core.name(), "tickle");
        // SAFETY: writing one byte from a static buffer into our own pipe.
        let rt = unsafe {
            libc::write(
                self.tickle_write.as_raw_fd(),
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rt != 1 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a wakeup.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(scheduler = %self.core.name(), error = %err, "tickle write failed");
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stopping_with(self.timers.next_expiry())
    }

    fn idle(&self) {
        tracing::debug!(scheduler = %self.core.name(), "idle");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let mut expired: Vec<TimerCallback> = Vec::new();
        let tickle_fd = self.tickle_read.as_raw_fd();

        loop {
            let next_timeout = self.timers.next_expiry();
            if self.stopping_with(next_timeout) {
                tracing::debug!(scheduler = %self.core.name(), "idle stopping exit");
                break;
            }

            let timeout = next_timeout.min(self.max_timeout_ms) as libc::c_int;
            let ready = loop {
                // SAFETY: `events` has `max_events` initialised slots.
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epoll.as_raw_fd(),
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout,
                    )
                };
                if rt >= 0 {
                    break rt as usize;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    tracing::error!(scheduler = %self.core.name(), error = %err, "epoll_wait failed");
                    break 0;
                }
            };

            self.timers.pop_expired(&mut expired);
            if !expired.is_empty() {
                tracing::debug!(scheduler = %self.core.name(), count = expired.len(), "timers expired");
                self.core
                    .schedule_batch(expired.drain(..).map(|callback| Work::callback(move || callback())));
            }

            for event in &events[..ready] {
                let flags = event.events;
                let fd = event.u64 as RawFd;
                if fd == tickle_fd {
                    self.drain_tickle();
                    continue;
                }
                self.dispatch_ready(fd, flags);
            }

            Fiber::yield_to_hold();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.core)
            .field("pending_events", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rt, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd) {
        let rt = unsafe { libc::write(fd.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rt, 1);
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_readable_pipe_fires_callback() {
        let io = IoManager::new(2, false, "readable").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = channel::bounded(1);

        io.add_event(r.as_raw_fd(), Event::Read, move || tx.send(()).unwrap())
            .unwrap();
        assert_eq!(io.pending_events(), 1);

        write_byte(&w);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| io.pending_events() == 0));
        io.stop();
    }

    #[test]
    fn test_cancel_event_fires_once() {
        let io = IoManager::new(1, false, "cancel").unwrap();
        let (r, _w) = pipe();
        let (tx, rx) = channel::unbounded();

        io.add_event(r.as_raw_fd(), Event::Read, move || tx.send(()).unwrap())
            .unwrap();
        assert!(io.cancel_event(r.as_raw_fd(), Event::Read));
        assert_eq!(io.pending_events(), 0);
        assert!(!io.cancel_event(r.as_raw_fd(), Event::Read));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        io.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_del_event_does_not_fire() {
        let io = IoManager::new(1, false, "del").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = channel::unbounded::<()>();

        io.add_event(r.as_raw_fd(), Event::Read, move || tx.send(()).unwrap())
            .unwrap();
        assert!(io.del_event(r.as_raw_fd(), Event::Read));
        assert!(!io.del_event(r.as_raw_fd(), Event::Read));
        assert_eq!(io.pending_events(), 0);

        write_byte(&w);
        thread::sleep(Duration::from_millis(50));
        io.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all_triggers_both_kinds() {
        let io = IoManager::new(1, false, "cancel_all").unwrap();
        let (r, _w) = pipe();
        let (tx, rx) = channel::unbounded();

        let tx_read = tx.clone();
        io.add_event(r.as_raw_fd(), Event::Read, move || tx_read.send(Event::Read).unwrap())
            .unwrap();
        io.add_event(r.as_raw_fd(), Event::Write, move || tx.send(Event::Write).unwrap())
            .unwrap();
        assert_eq!(io.pending_events(), 2);

        assert!(io.cancel_all(r.as_raw_fd()));
        assert!(!io.cancel_all(r.as_raw_fd()));
        assert_eq!(io.pending_events(), 0);

        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        seen.sort_by_key(|e| *e == Event::Write);
        assert_eq!(seen, vec![Event::Read, Event::Write]);
        io.stop();
    }

    #[test]
    fn test_register_failure_is_reported() {
        let io = IoManager::new(1, false, "eperm").unwrap();
        // Regular files cannot be polled.
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let fd = file.as_raw_fd();

        let err = io.add_event(fd, Event::Read, || {}).unwrap_err();
        match err {
            RuntimeError::Register { fd: failed, event, .. } => {
                assert_eq!(failed, fd);
                assert_eq!(event, Event::Read);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(io.pending_events(), 0);
        io.stop();
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_register_panics() {
        let io = IoManager::new(1, false, "double").unwrap();
        let (r, _w) = pipe();
        io.add_event(r.as_raw_fd(), Event::Read, || {}).unwrap();
        let _ = io.add_event(r.as_raw_fd(), Event::Read, || {});
    }

    #[test]
    fn test_table_grows_for_large_fd() {
        let io = IoManager::new(1, false, "grow").unwrap();
        let (r, _w) = pipe();
        let high = unsafe { libc::fcntl(r.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 100) };
        assert!(high >= 100);
        let high = unsafe { OwnedFd::from_raw_fd(high) };

        assert!(io.fd_capacity() <= high.as_raw_fd() as usize);
        io.add_event(high.as_raw_fd(), Event::Read, || {}).unwrap();
        assert!(io.fd_capacity() > high.as_raw_fd() as usize);
        assert!(io.del_event(high.as_raw_fd(), Event::Read));
        io.stop();
    }

    #[test]
    fn test_timer_callback_runs_on_worker() {
        let io = IoManager::new(1, false, "timer").unwrap();
        let (tx, rx) = channel::bounded(1);
        let started = Instant::now();
        io.add_timer(30, move || { let _ = tx.try_send(thread::current().id()); }, false);

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(worker, io.scheduler().thread_ids()[0]);
        io.stop();
    }

    #[test]
    fn test_wait_event_resumes_fiber() {
        let io = IoManager::new(1, false, "wait").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = channel::bounded(1);
        let fd = r.as_raw_fd();

        io.schedule(move || {
            let io = IoManager::current().expect("running inside the io manager");
            io.wait_event(fd, Event::Read).unwrap();
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            tx.send((n, byte[0])).unwrap();
        });

        assert!(wait_for(|| io.pending_events() == 1));
        write_byte(&w);
        let (n, byte) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((n, byte), (1, b'x'));
        io.stop();
        drop(r);
    }

    #[test]
    fn test_current_outside_workers() {
        assert!(IoManager::current().is_none());
        let io = IoManager::new(1, false, "outside").unwrap();
        assert!(IoManager::current().is_none());
        io.stop();
    }
}
