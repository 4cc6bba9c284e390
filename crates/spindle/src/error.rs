//! Runtime errors and contract-violation reporting.

use std::backtrace::Backtrace;
use std::io;
use std::os::unix::io::RawFd;

use crate::io::Event;

/// OS resource failures surfaced by the runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Creating the epoll instance or the tickle pipe failed
    #[error("failed to create reactor: {0}")]
    Reactor(#[source] io::Error),

    /// `epoll_ctl` rejected a registration change
    #[error("failed to register {event:?} on fd {fd}: {source}")]
    Register {
        /// Descriptor being registered
        fd: RawFd,
        /// Event kind being registered
        event: Event,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Mapping or protecting a fiber stack failed
    #[error("failed to allocate {size} byte fiber stack: {source}")]
    StackAlloc {
        /// Requested usable stack size
        size: usize,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Spawning a worker thread failed
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        /// Thread name that was requested
        name: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

/// Result alias used throughout the runtime
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Report a broken runtime invariant and panic.
///
/// The message is logged together with a captured backtrace before the
/// panic starts, so the report survives even when the panic is later caught
/// at a fiber boundary.
#[cold]
#[track_caller]
pub(crate) fn contract_violation(message: &str) -> ! {
    let backtrace = Backtrace::force_capture();
    tracing::error!(%backtrace, "contract violation: {}", message);
    panic!("contract violation: {}", message);
}

/// Check a runtime invariant, reporting a contract violation if it fails.
macro_rules! contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::contract_violation(&format!($($arg)+));
        }
    };
}

pub(crate) use contract;
