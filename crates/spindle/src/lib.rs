//! Spindle fiber runtime
//!
//! Stackful coroutines multiplexed over a pool of OS threads:
//! - **Fibers**: user-space execution contexts with their own stack (`fiber` module)
//! - **Scheduler**: N:M work dispatch with optional thread affinity (`scheduler` module)
//! - **Timers**: one-shot, recurring and conditional timers (`timer` module)
//! - **I/O**: an epoll reactor that parks fibers until a descriptor is ready (`io` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle::{Fiber, IoManager};
//!
//! let io = IoManager::new(2, false, "io")?;
//! io.schedule(|| {
//!     println!("running on {:?}", Fiber::current_id());
//!     Fiber::yield_to_ready();
//!     println!("and again");
//! });
//! io.add_timer(100, || println!("tick"), false);
//! io.stop();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("spindle drives I/O through epoll and only builds on Linux");

/// Runtime-wide tunables and environment overrides
pub mod config;

/// Error types
pub mod error;

/// Stackful fibers and context switching
pub mod fiber;

/// epoll reactor
pub mod io;

/// N:M scheduler
pub mod scheduler;

/// Timer queue
pub mod timer;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use fiber::{Fiber, FiberId, FiberState};
pub use io::{Event, IoManager};
pub use scheduler::{Affinity, Dispatch, Scheduler, SchedulerStats, SchedulerSwitcher, Work};
pub use timer::{Clock, SystemClock, Timer, TimerCallback, TimerManager};
