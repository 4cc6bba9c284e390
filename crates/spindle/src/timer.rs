//! Ordered timer set
//!
//! Timers live in a map keyed by `(deadline, id)` so equal deadlines stay
//! distinct entries. The reactor asks for the delay until the earliest
//! deadline, waits at most that long, then pops every expired callback and
//! schedules it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

/// How far the clock must jump backwards before the whole set is drained
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Timer callback; recurring timers call it once per period
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Millisecond time source
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Wall clock, milliseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// Mutable timer fields, guarded by the timer's own lock
struct TimerSlot {
    /// Absolute deadline in ms
    next: u64,
    /// Period in ms (the delay it was created with)
    period: u64,
    recurring: bool,
    /// `None` once fired (one-shot) or cancelled
    callback: Option<TimerCallback>,
}

/// A pending callback owned by a [`TimerManager`]
pub struct Timer {
    id: u64,
    manager: Weak<TimerQueue>,
    slot: Mutex<TimerSlot>,
}

struct TimerState {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last observed time, for rollover detection
    previous_ms: u64,
}

/// Shared part of a manager; timers point back at it
struct TimerQueue {
    state: RwLock<TimerState>,
    /// A front-insert notification is outstanding
    tickled: AtomicBool,
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
}

impl TimerQueue {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Insert under an already held write lock, then notify if it became the front.
    fn insert(&self, mut state: RwLockWriteGuard<'_, TimerState>, key: (u64, u64), timer: Arc<Timer>) {
        state.timers.insert(key, timer);
        let at_front = state.timers.keys().next() == Some(&key) && !self.tickled.load(Ordering::Acquire);
        if at_front {
            self.tickled.store(true, Ordering::Release);
        }
        drop(state);

        if at_front {
            if let Some(hook) = self.on_front.get() {
                hook();
            }
        }
    }
}

impl Timer {
    /// Remove the timer and drop its callback.
    ///
    /// Returns `false` if it already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.manager.upgrade() else {
            return false;
        };
        let mut state = queue.state.write();
        let mut slot = self.slot.lock();
        if slot.callback.take().is_none() {
            return false;
        }
        state.timers.remove(&(slot.next, self.id));
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(queue) = self.manager.upgrade() else {
            return false;
        };
        let mut state = queue.state.write();
        let mut slot = self.slot.lock();
        if slot.callback.is_none() {
            return false;
        }
        let Some(timer) = state.timers.remove(&(slot.next, self.id)) else {
            return false;
        };
        slot.next = queue.now_ms() + slot.period;
        state.timers.insert((slot.next, self.id), timer);
        true
    }

    /// Change the period and recompute the deadline.
    ///
    /// The new deadline counts from now when `from_now` is set, otherwise
    /// from the point the current period started.
    pub fn reset(&self, period: u64, from_now: bool) -> bool {
        let Some(queue) = self.manager.upgrade() else {
            return false;
        };
        let mut state = queue.state.write();
        let mut slot = self.slot.lock();
        if slot.callback.is_none() {
            return false;
        }
        if period == slot.period && !from_now {
            return true;
        }

        let Some(timer) = state.timers.remove(&(slot.next, self.id)) else {
            return false;
        };
        let start = if from_now {
            queue.now_ms()
        } else {
            slot.next.saturating_sub(slot.period)
        };
        slot.period = period;
        slot.next = start + period;
        let key = (slot.next, self.id);
        drop(slot);
        queue.insert(state, key, timer);
        true
    }

    /// Period in ms
    pub fn period(&self) -> u64 {
        self.slot.lock().period
    }

    /// Absolute deadline in ms
    pub fn deadline(&self) -> u64 {
        self.slot.lock().next
    }

    /// Whether the timer re-arms after firing
    pub fn is_recurring(&self) -> bool {
        self.slot.lock().recurring
    }

    /// Whether the timer is still armed
    pub fn is_active(&self) -> bool {
        self.slot.lock().callback.is_some()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &slot.next)
            .field("period", &slot.period)
            .field("recurring", &slot.recurring)
            .field("active", &slot.callback.is_some())
            .finish()
    }
}

/// Ordered set of timers
pub struct TimerManager {
    queue: Arc<TimerQueue>,
}

impl TimerManager {
    /// Create a manager on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a manager on a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let previous_ms = clock.now_ms();
        Self {
            queue: Arc::new(TimerQueue {
                state: RwLock::new(TimerState {
                    timers: BTreeMap::new(),
                    previous_ms,
                }),
                tickled: AtomicBool::new(false),
                on_front: OnceCell::new(),
                clock,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Install the hook run when a timer becomes the earliest deadline.
    ///
    /// Only the first hook is kept; returns whether this one was installed.
    pub fn on_front_insert<F>(&self, hook: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.queue.on_front.set(Box::new(hook)).is_ok()
    }

    /// Arm a timer firing `delay_ms` from now (and every `delay_ms` after, if recurring)
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.queue.next_id.fetch_add(1, Ordering::Relaxed);
        let next = self.queue.now_ms() + delay_ms;
        let timer = Arc::new(Timer {
            id,
            manager: Arc::downgrade(&self.queue),
            slot: Mutex::new(TimerSlot {
                next,
                period: delay_ms,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
        });

        let state = self.queue.state.write();
        self.queue.insert(state, (next, id), timer.clone());
        timer
    }

    /// Arm a timer whose callback only runs while `token` is still alive
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
        self.add_timer(
            delay_ms,
            move || {
                if token.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Delay until the earliest deadline: 0 if one is due, `u64::MAX` if none.
    ///
    /// Also re-enables the front-insert notification.
    pub fn next_expiry(&self) -> u64 {
        let state = self.queue.state.read();
        self.queue.tickled.store(false, Ordering::Release);
        match state.timers.keys().next() {
            None => u64::MAX,
            Some(&(next, _)) => next.saturating_sub(self.queue.now_ms()),
        }
    }

    /// Move the callbacks of every expired timer into `out`, in deadline order.
    ///
    /// Recurring timers are re-armed at now + period. If the clock jumped
    /// back by more than an hour every timer counts as expired.
    pub fn pop_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.queue.now_ms();
        if self.queue.state.read().timers.is_empty() {
            return;
        }

        let mut state = self.queue.state.write();
        if state.timers.is_empty() {
            return;
        }

        let rollover = detect_rollover(&mut state, now);
        if !rollover {
            if let Some(&(next, _)) = state.timers.keys().next() {
                if next > now {
                    return;
                }
            }
        }

        let expired = if rollover {
            tracing::warn!(now, timers = state.timers.len(), "clock rolled back, firing every timer");
            std::mem::take(&mut state.timers)
        } else {
            let pending = state.timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut state.timers, pending)
        };

        out.reserve(expired.len());
        for timer in expired.into_values() {
            let mut slot = timer.slot.lock();
            let Some(callback) = slot.callback.clone() else {
                continue;
            };
            out.push(callback);
            if slot.recurring {
                slot.next = now + slot.period;
                let key = (slot.next, timer.id);
                drop(slot);
                state.timers.insert(key, timer);
            } else {
                slot.callback = None;
            }
        }
    }

    /// Whether any timer is armed
    pub fn has_timer(&self) -> bool {
        !self.queue.state.read().timers.is_empty()
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.queue.state.read().timers.len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager").field("timers", &self.len()).finish()
    }
}

fn detect_rollover(state: &mut TimerState, now: u64) -> bool {
    let rollover = now < state.previous_ms.saturating_sub(ROLLOVER_THRESHOLD_MS);
    state.previous_ms = now;
    rollover
}
