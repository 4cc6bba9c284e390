//! Per-descriptor registration state

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Event;
use crate::error::contract;
use crate::scheduler::{Affinity, Dispatch, Work};

/// What to resume when one event kind fires
#[derive(Default)]
pub(crate) struct EventContext {
    /// Scheduler the target is handed back to
    pub(crate) scheduler: Option<Weak<dyn Dispatch>>,
    /// Fiber or callback to schedule
    pub(crate) target: Option<Work>,
}

impl EventContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.target.is_none()
    }
}

/// Registration state of one descriptor, guarded by the context's lock
pub(crate) struct FdState {
    /// Kinds currently registered with epoll (EPOLLIN/EPOLLOUT bits)
    pub(crate) events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    pub(crate) fn has(&self, event: Event) -> bool {
        self.events & event.bits() != 0
    }

    pub(crate) fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Forget a registration without running its target
    pub(crate) fn clear(&mut self, event: Event) {
        self.events &= !event.bits();
        *self.context_mut(event) = EventContext::default();
    }

    /// Hand the registered target to its scheduler and clear the slot.
    ///
    /// The slot is emptied before scheduling so a registration can fire at
    /// most once.
    pub(crate) fn trigger(&mut self, fd: RawFd, event: Event) {
        contract!(self.has(event), "trigger of unregistered {} on fd {}", event, fd);
        self.events &= !event.bits();

        let context = std::mem::take(self.context_mut(event));
        let scheduler = context.scheduler.as_ref().and_then(Weak::upgrade);
        match (scheduler, context.target) {
            (Some(scheduler), Some(target)) => {
                scheduler.core().schedule_work(target, Affinity::Any);
            }
            (None, Some(_)) => {
                tracing::warn!(fd, %event, "registering scheduler is gone, dropping event target");
            }
            (_, None) => {}
        }
    }
}

/// Registration record for one descriptor
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            state: Mutex::new(FdState {
                events: 0,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn test_trigger_schedules_once() {
        let scheduler = Scheduler::new(1, false, "fd").unwrap();
        let driver: Arc<dyn Dispatch> = scheduler.clone();
        let ctx = FdContext::new(5);
        {
            let mut state = ctx.state.lock();
            state.events |= Event::Read.bits();
            let slot = state.context_mut(Event::Read);
            slot.scheduler = Some(Arc::downgrade(&driver));
            slot.target = Some(Work::callback(|| {}));
            state.trigger(ctx.fd, Event::Read);
            assert!(!state.has(Event::Read));
            assert!(state.context_mut(Event::Read).is_empty());
        }
        assert_eq!(scheduler.queued(), 1);
        scheduler.start().unwrap();
        scheduler.stop();
    }

    #[test]
    #[should_panic(expected = "trigger of unregistered")]
    fn test_trigger_unregistered_panics() {
        let ctx = FdContext::new(3);
        ctx.state.lock().trigger(3, Event::Write);
    }

    #[test]
    fn test_clear_drops_target() {
        let ctx = FdContext::new(4);
        let mut state = ctx.state.lock();
        state.events |= Event::Write.bits() | Event::Read.bits();
        state.context_mut(Event::Write).target = Some(Work::callback(|| {}));
        state.clear(Event::Write);
        assert!(state.has(Event::Read));
        assert!(!state.has(Event::Write));
        assert!(state.context_mut(Event::Write).is_empty());
    }
}
