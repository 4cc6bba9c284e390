//! Work items queued on a scheduler

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::fiber::{Fiber, FiberFn, FiberState};

/// Something a worker thread can run
pub enum Work {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a closure on a scratch fiber
    Callback(FiberFn),
}

impl Work {
    /// Wrap a closure
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Work {
    fn from(fiber: Arc<Fiber>) -> Self {
        Work::Fiber(fiber)
    }
}

impl From<FiberFn> for Work {
    fn from(f: FiberFn) -> Self {
        Work::Callback(f)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Work::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Which worker thread may pick up a work item
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Affinity {
    /// Any worker of the scheduler
    #[default]
    Any,
    /// Only the given worker thread
    Thread(ThreadId),
}

impl Affinity {
    /// Whether a worker running on `thread` may take the item
    pub fn admits(self, thread: ThreadId) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Thread(target) => target == thread,
        }
    }
}

impl From<Option<ThreadId>> for Affinity {
    fn from(thread: Option<ThreadId>) -> Self {
        thread.map_or(Affinity::Any, Affinity::Thread)
    }
}

/// A queued work item with its affinity
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) work: Work,
    pub(crate) affinity: Affinity,
}

impl Task {
    pub(crate) fn new(work: Work, affinity: Affinity) -> Self {
        Self { work, affinity }
    }

    /// Try to take this item for execution.
    ///
    /// Callbacks are always taken. A fiber is taken only if this call moved
    /// it to EXEC; a fiber running elsewhere stays queued and a finished one
    /// is stale.
    pub(crate) fn claim(&self) -> Claim {
        match &self.work {
            Work::Callback(_) => Claim::Taken,
            Work::Fiber(fiber) => match fiber.try_claim() {
                Ok(()) => Claim::Taken,
                Err(FiberState::Exec) => Claim::Busy,
                Err(_) => Claim::Stale,
            },
        }
    }
}

/// Result of [`Task::claim`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
    Taken,
    Busy,
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_admits() {
        let me = std::thread::current().id();
        let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        assert!(Affinity::Any.admits(me));
        assert!(Affinity::Thread(me).admits(me));
        assert!(!Affinity::Thread(other).admits(me));
        assert_eq!(Affinity::from(None), Affinity::Any);
        assert_eq!(Affinity::from(Some(me)), Affinity::Thread(me));
    }

    #[test]
    fn test_claim_running_and_finished_fibers() {
        let main = Fiber::current();
        let task = Task::new(Work::Fiber(main), Affinity::Any);
        assert_eq!(task.claim(), Claim::Busy);

        let task = Task::new(Work::callback(|| {}), Affinity::Any);
        assert_eq!(task.claim(), Claim::Taken);

        let done = Fiber::new(|| {}, 0, false).unwrap();
        done.swap_in();
        let task = Task::new(Work::Fiber(done), Affinity::Any);
        assert_eq!(task.claim(), Claim::Stale);
    }

    #[test]
    fn test_claim_moves_fiber_to_exec_once() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        let first = Task::new(Work::Fiber(fiber.clone()), Affinity::Any);
        let second = Task::new(Work::Fiber(fiber.clone()), Affinity::Any);
        assert_eq!(first.claim(), Claim::Taken);
        assert_eq!(fiber.state(), FiberState::Exec);
        assert_eq!(second.claim(), Claim::Busy);

        let parked = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        assert_eq!(fiber.resume_claimed(&parked), FiberState::Term);
    }
}
