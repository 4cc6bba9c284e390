//! N:M fiber scheduler
//!
//! A [`Scheduler`] owns a FIFO queue of [`Work`] items and a pool of worker
//! threads. Each worker runs the dispatch loop in `worker.rs`, resuming
//! queued fibers and wrapping queued callbacks in a reusable scratch fiber.
//! What a worker does when the queue is empty (and how it is woken up) is
//! decided by the [`Dispatch`] implementation driving the loop: the plain
//! scheduler spins, the [`IoManager`](crate::io::IoManager) blocks in epoll.

#[allow(clippy::module_inception)]
mod scheduler;
mod task;
mod worker;

pub use scheduler::{Scheduler, SchedulerStats, SchedulerSwitcher};
pub use task::{Affinity, Work};

pub(crate) use task::{Claim, Task};

use std::any::Any;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

/// Behaviour a dispatch loop needs from whatever drives it
pub trait Dispatch: Send + Sync + 'static {
    /// The shared scheduler state
    fn core(&self) -> &Scheduler;

    /// Wake a worker that may be blocked waiting for work
    fn tickle(&self);

    /// Whether the workers may exit
    fn stopping(&self) -> bool;

    /// Body of the per-thread idle fiber; returns once stopping
    fn idle(&self);

    /// Upcast for downcasting to the concrete driver
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<dyn Dispatch>>> = const { RefCell::new(None) };
}

/// The scheduler driving the calling thread, if any
pub(crate) fn current_driver() -> Option<Arc<dyn Dispatch>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

pub(crate) fn set_current_driver(driver: Option<Weak<dyn Dispatch>>) {
    let previous = CURRENT_SCHEDULER.with(|c| std::mem::replace(&mut *c.borrow_mut(), driver));
    drop(previous);
}
