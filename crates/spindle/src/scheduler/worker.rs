//! Per-thread dispatch loop
//!
//! Every worker thread (and the caller thread's root fiber) runs [`run`]:
//! take the first runnable item, resume it, and fall back to the idle
//! fiber when nothing is runnable. The loop exits once the idle fiber
//! finishes, which it does only when the driver reports stopping.

use std::sync::Arc;
use std::thread;

use super::{set_current_driver, Dispatch, Work};
use crate::fiber::{Fiber, FiberState};

/// Dispatch loop for the calling thread
pub(crate) fn run(driver: Arc<dyn Dispatch>) {
    let core = driver.core();
    let me = thread::current().id();
    tracing::debug!(scheduler = %core.name(), thread = ?me, "dispatch loop running");
    set_current_driver(Some(Arc::downgrade(&driver)));

    let weak = Arc::downgrade(&driver);
    let idle = match Fiber::new(
        move || {
            if let Some(driver) = weak.upgrade() {
                driver.idle();
            }
        },
        0,
        false,
    ) {
        Ok(fiber) => fiber,
        Err(err) => {
            tracing::error!(scheduler = %core.name(), error = %err, "cannot create idle fiber");
            return;
        }
    };

    // Reused for callbacks so each one does not pay for a fresh stack.
    let mut scratch: Option<Arc<Fiber>> = None;

    loop {
        let (work, tickle_me) = core.take_next(me);
        if tickle_me {
            driver.tickle();
        }

        let work = match work {
            Some(work) => work,
            None => {
                // Count as idle before the second look: a concurrent
                // schedule either sees this worker idle and tickles it, or
                // its item is taken here.
                core.enter_idle();
                let (retry, tickle_me) = core.take_next(me);
                if tickle_me {
                    driver.tickle();
                }
                match retry {
                    Some(work) => {
                        core.leave_idle();
                        work
                    }
                    None => {
                        if idle.state().is_finished() {
                            core.leave_idle();
                            tracing::debug!(scheduler = %core.name(), thread = ?me, "idle fiber term");
                            break;
                        }
                        idle.swap_in();
                        core.leave_idle();
                        continue;
                    }
                }
            }
        };

        match work {
            Work::Fiber(fiber) => {
                let state = fiber.resume_claimed(core.parked_counter());
                core.leave_active();
                if state == FiberState::Ready {
                    core.schedule_fiber(fiber);
                }
            }
            Work::Callback(callback) => {
                let fiber = match scratch.take() {
                    Some(fiber) => {
                        fiber.reset_with(callback);
                        fiber
                    }
                    None => match Fiber::new(callback, 0, false) {
                        Ok(fiber) => fiber,
                        Err(err) => {
                            tracing::error!(
                                scheduler = %core.name(),
                                error = %err,
                                "dropping callback, cannot create fiber"
                            );
                            core.leave_active();
                            continue;
                        }
                    },
                };

                let state = fiber.swap_in_parking(core.parked_counter());
                core.leave_active();
                match state {
                    FiberState::Ready => core.schedule_fiber(fiber),
                    state if state.is_finished() => scratch = Some(fiber),
                    // Parked; whoever holds it is responsible for rescheduling.
                    _ => {}
                }
            }
        }
    }
}
