//! Scheduler core: work queue, worker threads, start and stop

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::{current_driver, set_current_driver, worker, Affinity, Claim, Dispatch, Task, Work};
use crate::error::{contract, contract_violation, RuntimeError, RuntimeResult};
use crate::fiber::{self, Fiber, FiberState};

/// Scheduler statistics
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Diagnostic name
    pub name: String,

    /// Worker threads, including the caller thread when it participates
    pub thread_count: usize,

    /// Workers currently running a fiber or callback
    pub active_threads: usize,

    /// Workers currently inside their idle fiber
    pub idle_threads: usize,

    /// Whether stop has been requested
    pub stopping: bool,

    /// IDs of the worker threads
    pub thread_ids: Vec<ThreadId>,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[Scheduler name={} size={} active_count={} idle_count={} stopping={}]",
            self.name, self.thread_count, self.active_threads, self.idle_threads, self.stopping
        )?;
        write!(f, "    ")?;
        for (i, id) in self.thread_ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", id)?;
        }
        Ok(())
    }
}

/// N:M fiber scheduler
pub struct Scheduler {
    /// Diagnostic name, also the prefix of worker thread names
    name: String,

    /// Pending work, FIFO
    queue: Mutex<VecDeque<Task>>,

    /// Spawned worker threads
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// IDs of every worker thread, the caller thread first if it participates
    thread_ids: Mutex<Vec<ThreadId>>,

    /// Fiber running the dispatch loop on the caller thread
    root_fiber: Option<Arc<Fiber>>,

    /// The caller thread, when it participates
    root_thread: Option<ThreadId>,

    /// Total number of workers
    thread_count: usize,

    /// Number of OS threads spawned by `start`
    spawn_count: usize,

    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Fibers that yielded to HOLD on a worker and were not resumed since
    parked_fibers: Arc<AtomicUsize>,
    started: AtomicBool,
    stop_requested: AtomicBool,

    /// The object whose `tickle`/`idle`/`stopping` drive this core
    driver: OnceCell<Weak<dyn Dispatch>>,
}

impl Scheduler {
    /// Create a plain scheduler.
    ///
    /// `thread_count` is the total number of workers (0 = one per CPU). When
    /// `use_caller` is set the calling thread is one of them: it runs the
    /// dispatch loop inside [`Scheduler::stop`], and only `thread_count - 1`
    /// threads are spawned.
    pub fn new(thread_count: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<Scheduler>> {
        let scheduler = Arc::new(Scheduler::build(thread_count, use_caller, name)?);
        let driver: Weak<dyn Dispatch> = Arc::downgrade(&scheduler) as Weak<dyn Dispatch>;
        scheduler.attach(driver);
        Ok(scheduler)
    }

    /// Build an unattached core; [`Scheduler::attach`] must follow.
    pub(crate) fn build(thread_count: usize, use_caller: bool, name: &str) -> RuntimeResult<Scheduler> {
        let thread_count = if thread_count == 0 {
            num_cpus::get()
        } else {
            thread_count
        };

        let (root_fiber, root_thread, spawn_count) = if use_caller {
            contract!(
                current_driver().is_none(),
                "thread {:?} already drives a scheduler",
                thread::current().id()
            );
            // Materialise the thread main fiber the root fiber returns to.
            Fiber::current();
            // The real entry is installed by `attach`.
            let root = Fiber::new(|| {}, 0, true)?;
            (Some(root), Some(thread::current().id()), thread_count - 1)
        } else {
            (None, None, thread_count)
        };

        tracing::debug!(
            scheduler = name,
            thread_count,
            use_caller,
            "scheduler created"
        );

        Ok(Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(root_thread.into_iter().collect()),
            root_fiber,
            root_thread,
            thread_count,
            spawn_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            parked_fibers: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            driver: OnceCell::new(),
        })
    }

    /// Bind the core to the object driving it and claim the caller thread.
    pub(crate) fn attach(&self, driver: Weak<dyn Dispatch>) {
        if let Some(root) = &self.root_fiber {
            let weak = driver.clone();
            root.reset(move || match weak.upgrade() {
                Some(driver) => worker::run(driver),
                None => tracing::warn!("root fiber started after its scheduler was dropped"),
            });
            set_current_driver(Some(driver.clone()));
            fiber::set_dispatch_fiber(Some(root.clone()));
        }
        if self.driver.set(driver).is_err() {
            contract_violation("scheduler attached twice");
        }
    }

    pub(crate) fn driver_weak(&self) -> Option<Weak<dyn Dispatch>> {
        self.driver.get().cloned()
    }

    fn driver(&self) -> Arc<dyn Dispatch> {
        match self.driver.get().and_then(Weak::upgrade) {
            Some(driver) => driver,
            None => contract_violation("scheduler has no live driver"),
        }
    }

    /// The scheduler driving the calling thread, if any
    pub fn current() -> Option<Arc<dyn Dispatch>> {
        current_driver()
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of workers, including the caller thread when it participates
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// IDs of the worker threads known so far
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    /// Number of queued work items
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether any worker is parked in its idle fiber
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    /// Number of fibers parked in HOLD by this scheduler's workers
    pub fn parked_fibers(&self) -> usize {
        self.parked_fibers.load(Ordering::Acquire)
    }

    /// Whether `stop` has been requested
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Queue a closure for any worker
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::callback(f), Affinity::Any);
    }

    /// Queue a closure for one specific worker thread
    pub fn schedule_on<F>(&self, f: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::callback(f), Affinity::Thread(thread));
    }

    /// Queue a suspended fiber to be resumed by any worker
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_work(Work::Fiber(fiber), Affinity::Any);
    }

    /// Queue a work item. Wakes a worker only if the queue was empty.
    pub fn schedule_work(&self, work: Work, affinity: Affinity) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Task::new(work, affinity));
            was_empty
        };
        if was_empty {
            self.wake_worker();
        }
    }

    /// Queue several items at once, with no affinity
    pub fn schedule_batch<I>(&self, items: I)
    where
        I: IntoIterator,
        I::Item: Into<Work>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(items.into_iter().map(|w| Task::new(w.into(), Affinity::Any)));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.wake_worker();
        }
    }

    fn wake_worker(&self) {
        if let Some(driver) = self.driver.get().and_then(Weak::upgrade) {
            driver.tickle();
        }
    }

    /// Take the first item runnable on `thread`.
    ///
    /// The scan is linear in the queue length: items pinned to other
    /// threads, and fibers still executing elsewhere, are skipped and left
    /// in place. Entries for fibers that already finished are dropped. A
    /// returned fiber has been claimed (moved to EXEC) and must be resumed
    /// with [`Fiber::resume_claimed`]. The flag asks the caller to wake
    /// another worker because something was left behind.
    pub(crate) fn take_next(&self, thread: ThreadId) -> (Option<Work>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle_me = false;
        let mut found = None;
        let mut i = 0;
        while i < queue.len() {
            let task = &queue[i];
            if !task.affinity.admits(thread) {
                tickle_me = true;
                i += 1;
                continue;
            }
            match task.claim() {
                Claim::Taken => {
                    found = Some(i);
                    break;
                }
                Claim::Busy => i += 1,
                Claim::Stale => {
                    queue.remove(i);
                }
            }
        }

        let work = found.and_then(|i| queue.remove(i)).map(|task| {
            self.active_threads.fetch_add(1, Ordering::AcqRel);
            task.work
        });
        if let Some(i) = found {
            tickle_me |= i < queue.len();
        }
        (work, tickle_me)
    }

    pub(crate) fn parked_counter(&self) -> &Arc<AtomicUsize> {
        &self.parked_fibers
    }

    pub(crate) fn leave_active(&self) {
        self.active_threads.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn enter_idle(&self) {
        self.idle_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_idle(&self) {
        self.idle_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// Base stopping condition: stop requested, queue drained, no worker
    /// mid-resume and no fiber left parked by a worker
    pub fn can_stop(&self) -> bool {
        let queue = self.queue.lock();
        self.stop_requested.load(Ordering::Acquire)
            && queue.is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
            && self.parked_fibers.load(Ordering::Acquire) == 0
    }

    /// Stopping condition of whatever drives this scheduler
    pub fn is_stopping(&self) -> bool {
        self.driver().stopping()
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> RuntimeResult<()> {
        let mut threads = self.threads.lock();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let driver = self.driver();
        for i in 0..self.spawn_count {
            let name = format!("{}_{}", self.name, i);
            let d = driver.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker::run(d))
                .map_err(|source| RuntimeError::Spawn { name, source })?;
            self.thread_ids.lock().push(handle.thread().id());
            threads.push(handle);
        }

        tracing::info!(scheduler = %self.name, threads = self.spawn_count, "scheduler started");
        Ok(())
    }

    /// Request shutdown and wait for every worker to drain and exit.
    ///
    /// With a participating caller thread this must be called on that
    /// thread, outside any fiber: the caller's own dispatch loop runs here
    /// until the scheduler is stopping. Otherwise it must not be called from
    /// one of this scheduler's workers.
    pub fn stop(&self) {
        let driver = self.driver();
        self.stop_requested.store(true, Ordering::Release);

        if let Some(root) = &self.root_fiber {
            if self.spawn_count == 0
                && matches!(root.state(), FiberState::Init | FiberState::Term)
                && driver.stopping()
            {
                self.release_caller_thread();
                tracing::info!(scheduler = %self.name, "scheduler stopped");
                return;
            }
        }

        let on_self = current_driver().is_some_and(|d| std::ptr::eq(d.core(), self));
        if let Some(root_thread) = self.root_thread {
            contract!(
                on_self && thread::current().id() == root_thread,
                "scheduler {} must be stopped from its caller thread",
                self.name
            );
        } else {
            contract!(
                !on_self,
                "scheduler {} stopped from one of its own workers",
                self.name
            );
        }

        for _ in 0..self.spawn_count {
            driver.tickle();
        }

        if let Some(root) = &self.root_fiber {
            driver.tickle();
            if !driver.stopping() {
                root.call();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or_default().to_string();
            if handle.join().is_err() {
                tracing::error!(scheduler = %self.name, thread = %name, "worker thread panicked");
            }
        }

        self.release_caller_thread();
        tracing::info!(scheduler = %self.name, "scheduler stopped");
    }

    fn release_caller_thread(&self) {
        if self.root_thread == Some(thread::current().id()) {
            fiber::set_dispatch_fiber(None);
            set_current_driver(None);
        }
    }

    /// Move the calling fiber onto this scheduler (optionally onto one thread).
    ///
    /// Returns immediately when already running on this scheduler and no
    /// other thread is requested; otherwise the fiber is queued here and
    /// suspended, and resumes on a worker of this scheduler.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        let current = current_driver();
        contract!(current.is_some(), "switch_to called outside any scheduler");
        let on_self = current.is_some_and(|d| std::ptr::eq(d.core(), self));
        if on_self && thread.map_or(true, |t| t == thread::current().id()) {
            return;
        }

        self.schedule_work(Work::Fiber(Fiber::current()), Affinity::from(thread));
        Fiber::yield_to_hold();
    }

    /// Snapshot of the scheduler's counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            name: self.name.clone(),
            thread_count: self.thread_count,
            active_threads: self.active_threads.load(Ordering::Acquire),
            idle_threads: self.idle_threads.load(Ordering::Acquire),
            stopping: self.stop_requested(),
            thread_ids: self.thread_ids(),
        }
    }
}

impl Dispatch for Scheduler {
    fn core(&self) -> &Scheduler {
        self
    }

    fn tickle(&self) {
        tracing::trace!(scheduler = %self.name, "tickle");
    }

    fn stopping(&self) -> bool {
        self.can_stop()
    }

    fn idle(&self) {
        tracing::debug!(scheduler = %self.name, "idle");
        while !self.can_stop() {
            thread::yield_now();
            Fiber::yield_to_hold();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("thread_count", &self.thread_count)
            .field("queued", &self.queued())
            .finish()
    }
}

/// Runs the enclosing fiber on `target` for the guard's lifetime.
///
/// Creating the guard switches the calling fiber to `target`; dropping it
/// switches back to the scheduler that was current at creation.
pub struct SchedulerSwitcher {
    caller: Option<Arc<dyn Dispatch>>,
}

impl SchedulerSwitcher {
    /// Switch to `target` (if any), remembering the current scheduler
    pub fn new(target: Option<&Scheduler>) -> Self {
        let caller = current_driver();
        if let Some(target) = target {
            target.switch_to(None);
        }
        Self { caller }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(caller) = self.caller.take() {
            caller.core().switch_to(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(4, false, "create").unwrap();
        assert_eq!(scheduler.name(), "create");
        assert_eq!(scheduler.thread_count(), 4);
        assert!(scheduler.thread_ids().is_empty());
        scheduler.stop();
    }

    #[test]
    fn test_scheduler_default_thread_count() {
        let scheduler = Scheduler::new(0, false, "cpus").unwrap();
        assert_eq!(scheduler.thread_count(), num_cpus::get());
        scheduler.stop();
    }

    #[test]
    fn test_fifo_on_caller_thread() {
        let scheduler = Scheduler::new(1, true, "fifo").unwrap();
        let me = thread::current().id();
        assert_eq!(scheduler.thread_ids(), vec![me]);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 1..=3 {
            let order = order.clone();
            scheduler.schedule_on(move || order.lock().push((i, thread::current().id())), me);
        }
        scheduler.start().unwrap();
        scheduler.stop();

        let order = order.lock();
        assert_eq!(order.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(order.iter().all(|(_, t)| *t == me));
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_stop_without_start_drains_caller_queue() {
        let scheduler = Scheduler::new(1, true, "lazy").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scheduler.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_workers_drain_queue() {
        let scheduler = Scheduler::new(3, false, "drain").unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.thread_ids().len(), 3);

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            scheduler.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn test_start_is_idempotent() {
        let scheduler = Scheduler::new(2, false, "twice").unwrap();
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.thread_ids().len(), 2);
        scheduler.stop();
    }

    #[test]
    fn test_ready_fiber_is_requeued() {
        let scheduler = Scheduler::new(2, false, "ready").unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    s.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_to_ready();
                }
            },
            0,
            false,
        )
        .unwrap();
        scheduler.schedule_fiber(fiber.clone());
        scheduler.start().unwrap();
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_held_fiber_waits_for_reschedule() {
        let scheduler = Scheduler::new(1, false, "hold").unwrap();
        scheduler.start().unwrap();

        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
        .unwrap();
        scheduler.schedule_fiber(fiber.clone());

        while fiber.state() != FiberState::Hold {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        scheduler.schedule_fiber(fiber.clone());
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let scheduler = Scheduler::new(1, false, "panics").unwrap();
        scheduler.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(|| panic!("callback failure"));
        let h = hits.clone();
        scheduler.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_current_inside_callback() {
        let scheduler = Scheduler::new(1, false, "current").unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);
        scheduler.schedule(move || {
            let name = Scheduler::current().map(|d| d.core().name().to_string());
            tx.send(name).unwrap();
        });
        scheduler.start().unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("current"));
        scheduler.stop();
    }

    #[test]
    fn test_switch_to_other_scheduler() {
        let a = Scheduler::new(1, false, "a").unwrap();
        let b = Scheduler::new(1, false, "b").unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let target = b.clone();
        a.schedule(move || {
            let before = thread::current().id();
            target.switch_to(None);
            let after = thread::current().id();
            tx.send((before, after)).unwrap();
        });

        let (before, after) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(before, a.thread_ids()[0]);
        assert_eq!(after, b.thread_ids()[0]);
        a.stop();
        b.stop();
    }

    #[test]
    fn test_scheduler_switcher_round_trip() {
        let a = Scheduler::new(1, false, "home").unwrap();
        let b = Scheduler::new(1, false, "away").unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let target = b.clone();
        a.schedule(move || {
            let start = thread::current().id();
            let away = {
                let _guard = SchedulerSwitcher::new(Some(&target));
                thread::current().id()
            };
            let back = thread::current().id();
            tx.send((start, away, back)).unwrap();
        });

        let (start, away, back) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(start, a.thread_ids()[0]);
        assert_eq!(away, b.thread_ids()[0]);
        assert_eq!(back, a.thread_ids()[0]);
        a.stop();
        b.stop();
    }

    #[test]
    fn test_stats_display() {
        let scheduler = Scheduler::new(1, true, "dump").unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.thread_count, 1);
        assert!(!stats.stopping);
        let text = stats.to_string();
        assert!(text.starts_with("[Scheduler name=dump size=1 active_count=0 idle_count=0 stopping=false]"));
        assert!(text.contains("ThreadId"));
        scheduler.stop();
        assert!(scheduler.stats().stopping);
    }

    #[test]
    #[should_panic(expected = "already drives a scheduler")]
    fn test_two_caller_schedulers_on_one_thread() {
        let _first = Scheduler::new(1, true, "first").unwrap();
        let _second = Scheduler::new(1, true, "second").unwrap();
    }
}
