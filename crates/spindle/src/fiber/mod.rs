//! Stackful fibers.
//!
//! A [`Fiber`] owns a stack and a saved machine context. Switching is
//! synchronous and happens on the thread that resumes the fiber. Every
//! thread has one implicit main fiber (its original stack) created lazily
//! by [`Fiber::current`], plus an optional dispatch fiber installed by the
//! scheduler; `swap_in`/`swap_out` switch against the dispatch fiber while
//! `call`/`back` switch against the thread main fiber.

mod context;
mod stack;

pub use context::Context;
pub use stack::Stack;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{contract, contract_violation, RuntimeResult};

/// Boxed fiber entry closure
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a Fiber. The thread main fibers all use id 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Primed with an entry, never run since creation or reset
    Init = 0,
    /// Suspended; runs again only if explicitly rescheduled
    Hold = 1,
    /// Currently executing on some thread
    Exec = 2,
    /// Entry returned normally
    Term = 3,
    /// Suspended and asking to be requeued
    Ready = 4,
    /// Entry panicked
    Except = 5,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }

    /// Whether the fiber has finished running its entry
    pub fn is_finished(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

/// How a fiber's entry ended
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
}

/// Mutable parts of a fiber, touched only by the thread switching it
struct Slot {
    context: Context,
    stack: Option<Stack>,
    entry: Option<FiberFn>,
}

/// A stackful, cooperatively scheduled unit of execution
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Finishes by returning to the thread main fiber instead of the dispatch fiber
    runs_on_caller: bool,
    /// Set by `yield_to_ready`; the resumer turns EXEC into READY once the switch is done
    requeue: AtomicBool,
    slot: UnsafeCell<Slot>,
    failure: Mutex<Option<String>>,
    /// Parked-fiber counter of the scheduler this fiber is parked in
    parked_in: Mutex<Option<Arc<AtomicUsize>>>,
}

// The slot is only accessed by the thread that is switching into or out of
// the fiber. A fiber stays EXEC until its context has been saved, and only
// the thread that wins the compare-and-swap out of INIT/HOLD/READY may resume
// it, so two threads never switch into it at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    /// The fiber executing on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// This thread's original stack
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// Where `swap_out` returns to; the thread main fiber when unset
    static DISPATCH: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Create a fiber that will run `entry` on its own stack.
    ///
    /// A `stack_size` of 0 uses the configured default. When
    /// `runs_on_caller` is set the fiber returns to the thread main fiber on
    /// completion (resume it with [`Fiber::call`]); otherwise it returns to
    /// the thread's dispatch fiber (resume it with [`Fiber::swap_in`]).
    pub fn new<F>(entry: F, stack_size: usize, runs_on_caller: bool) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            RuntimeConfig::global().fiber_stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            runs_on_caller,
            requeue: AtomicBool::new(false),
            slot: UnsafeCell::new(Slot {
                context: Context::empty(),
                stack: Some(stack),
                entry: Some(Box::new(entry)),
            }),
            failure: Mutex::new(None),
            parked_in: Mutex::new(None),
        });
        fiber.prime();
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(fiber = %fiber.id, stack = size, "fiber created");
        Ok(fiber)
    }

    /// The stackless fiber standing for a thread's original stack
    fn thread_main() -> Arc<Fiber> {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId(0),
            state: AtomicU8::new(FiberState::Exec as u8),
            runs_on_caller: false,
            requeue: AtomicBool::new(false),
            slot: UnsafeCell::new(Slot {
                context: Context::empty(),
                stack: None,
                entry: None,
            }),
            failure: Mutex::new(None),
            parked_in: Mutex::new(None),
        })
    }

    /// Point the saved context at the trampoline on a fresh stack frame.
    fn prime(&self) {
        let slot = self.slot.get();
        // SAFETY: the fiber is not running (INIT/TERM/EXCEPT), so nothing
        // else touches the slot; `self` lives inside an Arc and never moves.
        unsafe {
            if let Some(stack) = (*slot).stack.as_ref() {
                let top = stack.top();
                (*slot)
                    .context
                    .prime(top, trampoline, self as *const Fiber as usize);
            }
        }
    }

    /// Replace the entry of a finished (or never started) fiber, reusing its stack.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_with(Box::new(entry));
    }

    pub(crate) fn reset_with(&self, entry: FiberFn) {
        // SAFETY: read-only peek; the state check below rejects running fibers.
        let has_stack = unsafe { (*self.slot.get()).stack.is_some() };
        contract!(has_stack, "reset on stackless fiber {}", self.id);
        let state = self.state();
        contract!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );

        // SAFETY: the fiber is not running, so the slot is exclusively ours.
        unsafe {
            (*self.slot.get()).entry = Some(entry);
        }
        self.failure.lock().take();
        self.prime();
        self.set_state(FiberState::Init);
    }

    /// Fiber ID
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Message of the panic that ended this fiber, if it ended in EXCEPT
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Size of the owned stack; 0 for a thread main fiber
    pub fn stack_size(&self) -> usize {
        // SAFETY: the stack is only replaced on drop.
        unsafe { (*self.slot.get()).stack.as_ref().map_or(0, Stack::size) }
    }

    fn context_ptr(&self) -> *mut Context {
        // SAFETY: projecting a field pointer does not create a reference.
        unsafe { std::ptr::addr_of_mut!((*self.slot.get()).context) }
    }

    /// Move a resumable fiber to EXEC.
    ///
    /// Fails with the observed state when the fiber is already executing
    /// somewhere or has finished. On success the fiber is no longer counted
    /// as parked by the scheduler that held it.
    pub(crate) fn try_claim(&self) -> Result<(), FiberState> {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let state = FiberState::from_u8(raw);
            if state == FiberState::Exec || state.is_finished() {
                return Err(state);
            }
            match self.state.compare_exchange_weak(
                raw,
                FiberState::Exec as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => raw = actual,
            }
        }
        self.release_parked();
        Ok(())
    }

    fn claim(&self) {
        match self.try_claim() {
            Ok(()) => {}
            Err(FiberState::Exec) => {
                contract_violation(&format!("resuming fiber {} which is already executing", self.id))
            }
            Err(state) => contract_violation(&format!(
                "resuming fiber {} which already finished ({:?})",
                self.id, state
            )),
        }
        contract!(self.stack_size() > 0, "resuming stackless fiber {}", self.id);
    }

    fn release_parked(&self) {
        if let Some(parked) = self.parked_in.lock().take() {
            parked.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Settle the state of a fiber that just switched back to its resumer.
    ///
    /// A fiber that asked to be requeued becomes READY, any other still
    /// running fiber is parked in HOLD (and counted in `parked` when given).
    /// Returns the state the fiber left in. Once settled the fiber may be
    /// picked up elsewhere, so callers must act on this value rather than
    /// reading the state again.
    fn settle(&self, parked: Option<&Arc<AtomicUsize>>) -> FiberState {
        let next = if self.requeue.swap(false, Ordering::AcqRel) {
            FiberState::Ready
        } else {
            FiberState::Hold
        };
        if next == FiberState::Hold && self.state() == FiberState::Exec {
            if let Some(parked) = parked {
                parked.fetch_add(1, Ordering::AcqRel);
                *self.parked_in.lock() = Some(parked.clone());
            }
        }
        match self.state.compare_exchange(
            FiberState::Exec as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => next,
            Err(raw) => FiberState::from_u8(raw),
        }
    }

    /// Switch from the thread's dispatch fiber into this fiber.
    ///
    /// Returns once the fiber yields or finishes, with the state it left in.
    pub fn swap_in(self: &Arc<Self>) -> FiberState {
        self.claim();
        self.enter_from(dispatch_fiber(), None)
    }

    /// Resume on behalf of a scheduler: a HOLD yield is counted in `parked`
    /// until the fiber is resumed again or dropped.
    pub(crate) fn swap_in_parking(self: &Arc<Self>, parked: &Arc<AtomicUsize>) -> FiberState {
        self.claim();
        self.enter_from(dispatch_fiber(), Some(parked))
    }

    /// Like [`Fiber::swap_in_parking`] for a fiber already claimed through [`Fiber::try_claim`]
    pub(crate) fn resume_claimed(self: &Arc<Self>, parked: &Arc<AtomicUsize>) -> FiberState {
        self.enter_from(dispatch_fiber(), Some(parked))
    }

    fn enter_from(self: &Arc<Self>, from: *const Fiber, parked: Option<&Arc<AtomicUsize>>) -> FiberState {
        set_current(Some(self.clone()));

        // SAFETY: `from` is the dispatch or thread main fiber, kept alive by
        // thread-local state or its scheduler; `self` is kept alive by the
        // caller's Arc and was claimed (EXEC) by this thread.
        unsafe { Context::switch((*from).context_ptr(), self.context_ptr()) };

        self.settle(parked)
    }

    /// Switch from this fiber back to the thread's dispatch fiber.
    pub fn swap_out(&self) {
        let to = dispatch_fiber();
        set_current_ptr(to);

        // SAFETY: see `swap_in`.
        unsafe { Context::switch(self.context_ptr(), (*to).context_ptr()) };
    }

    /// Switch from the thread main fiber into this fiber.
    pub fn call(self: &Arc<Self>) -> FiberState {
        self.claim();
        self.enter_from(thread_main_ptr(), None)
    }

    /// Switch from this fiber back to the thread main fiber.
    pub fn back(&self) {
        let to = thread_main_ptr();
        set_current_ptr(to);

        // SAFETY: see `call`.
        unsafe { Context::switch(self.context_ptr(), (*to).context_ptr()) };
    }

    /// Return control to whoever resumed this fiber.
    fn yield_back(&self) {
        if self.runs_on_caller {
            self.back();
        } else {
            self.swap_out();
        }
    }

    /// The fiber running on this thread, creating the thread main fiber if needed
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|c| c.borrow().clone()) {
            return fiber;
        }
        let main = THREAD_MAIN.with(|m| m.borrow_mut().get_or_insert_with(Fiber::thread_main).clone());
        set_current(Some(main.clone()));
        main
    }

    /// ID of the fiber running on this thread, 0 if none was ever created
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id.as_u64()))
    }

    /// Number of fibers currently alive in the process
    pub fn total() -> u64 {
        TOTAL_FIBERS.load(Ordering::Relaxed)
    }

    /// Suspend the running fiber and ask to be requeued.
    ///
    /// The fiber stays EXEC until its resumer has switched away from it.
    pub fn yield_to_ready() {
        let fiber = current_ptr();
        // SAFETY: the running fiber is kept alive by whoever resumed it.
        let fiber = unsafe { &*fiber };
        contract!(
            fiber.state() == FiberState::Exec,
            "yield_to_ready from fiber {} in state {:?}",
            fiber.id,
            fiber.state()
        );
        contract!(fiber.stack_size() > 0, "yield_to_ready from a thread main fiber");
        fiber.requeue.store(true, Ordering::Release);
        fiber.yield_back();
    }

    /// Suspend the running fiber; the resumer parks it in HOLD.
    pub fn yield_to_hold() {
        let fiber = current_ptr();
        // SAFETY: see `yield_to_ready`.
        let fiber = unsafe { &*fiber };
        contract!(
            fiber.state() == FiberState::Exec,
            "yield_to_hold from fiber {} in state {:?}",
            fiber.id,
            fiber.state()
        );
        contract!(fiber.stack_size() > 0, "yield_to_hold from a thread main fiber");
        fiber.yield_back();
    }

    /// Run the entry closure, turning a panic into EXCEPT.
    fn run_entry(&self) {
        // SAFETY: we are the running fiber; nobody else touches the slot.
        let entry = unsafe { (*self.slot.get()).entry.take() };
        let outcome = match entry {
            Some(entry) => match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(()) => Outcome::Completed,
                Err(payload) => Outcome::Failed(panic_message(payload.as_ref())),
            },
            None => Outcome::Completed,
        };

        match outcome {
            Outcome::Completed => self.set_state(FiberState::Term),
            Outcome::Failed(message) => {
                let backtrace = Backtrace::force_capture();
                tracing::error!(fiber = %self.id, %backtrace, "fiber failed: {}", message);
                *self.failure.lock() = Some(message);
                self.set_state(FiberState::Except);
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.slot.get_mut().stack.is_none() {
            return;
        }
        match self.state() {
            FiberState::Exec => {
                tracing::error!(
                    fiber = %self.id,
                    backtrace = %Backtrace::force_capture(),
                    "fiber dropped while executing"
                );
                std::process::abort();
            }
            FiberState::Hold | FiberState::Ready => {
                self.release_parked();
                tracing::warn!(fiber = %self.id, "dropping suspended fiber");
            }
            state => tracing::trace!(fiber = %self.id, ?state, "fiber destroyed"),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

extern "C" fn trampoline(arg: usize) -> ! {
    // SAFETY: `arg` is the address of the fiber that was primed; its
    // resumer holds a strong reference for as long as it runs.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_entry();
    fiber.yield_back();

    tracing::error!(fiber = %fiber.id, "finished fiber was resumed");
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn set_current(fiber: Option<Arc<Fiber>>) {
    // Dropping the previous value may free a fiber; do it outside the borrow.
    let previous = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), fiber));
    drop(previous);
}

/// Make the fiber at `ptr` current. `ptr` must come from a live Arc.
fn set_current_ptr(ptr: *const Fiber) {
    // SAFETY: callers pass pointers obtained from Arcs that are still alive.
    let fiber = unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    };
    set_current(Some(fiber));
}

fn current_ptr() -> *const Fiber {
    Arc::as_ptr(&Fiber::current())
}

fn thread_main_ptr() -> *const Fiber {
    THREAD_MAIN.with(|m| Arc::as_ptr(m.borrow_mut().get_or_insert_with(Fiber::thread_main)))
}

fn dispatch_fiber() -> *const Fiber {
    match DISPATCH.with(|d| d.borrow().as_ref().map(Arc::as_ptr)) {
        Some(ptr) => ptr,
        None => thread_main_ptr(),
    }
}

/// Install (or clear) the fiber that `swap_in`/`swap_out` switch against on this thread.
pub(crate) fn set_dispatch_fiber(fiber: Option<Arc<Fiber>>) {
    let previous = DISPATCH.with(|d| std::mem::replace(&mut *d.borrow_mut(), fiber));
    drop(previous);
}
