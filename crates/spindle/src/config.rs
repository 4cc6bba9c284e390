//! Runtime configuration and default constants.
//!
//! Every tunable the runtime reads lives here. Values come from
//! [`RuntimeConfig::default`], optionally overlaid with `SPINDLE_*`
//! environment variables, and are frozen into a process-wide instance on
//! first use.

use once_cell::sync::OnceCell;

/// Default fiber stack size in bytes (128 KiB).
pub const DEFAULT_FIBER_STACK_SIZE: usize = 128 * 1024;

/// Upper bound on a single reactor wait, in milliseconds.
pub const DEFAULT_REACTOR_MAX_TIMEOUT_MS: u64 = 3000;

/// Number of readiness events collected per reactor wait.
pub const DEFAULT_REACTOR_MAX_EVENTS: usize = 256;

/// Initial size of the per-fd context table.
pub const DEFAULT_INITIAL_FD_CAPACITY: usize = 32;

const ENV_FIBER_STACK_SIZE: &str = "SPINDLE_FIBER_STACK_SIZE";
const ENV_REACTOR_MAX_TIMEOUT_MS: &str = "SPINDLE_REACTOR_MAX_TIMEOUT_MS";
const ENV_REACTOR_MAX_EVENTS: &str = "SPINDLE_REACTOR_MAX_EVENTS";
const ENV_INITIAL_FD_CAPACITY: &str = "SPINDLE_INITIAL_FD_CAPACITY";

static GLOBAL: OnceCell<RuntimeConfig> = OnceCell::new();

/// Runtime tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size used when a fiber is created with a stack size of 0
    pub fiber_stack_size: usize,

    /// Hard cap on how long the reactor blocks in `epoll_wait`
    pub reactor_max_timeout_ms: u64,

    /// Capacity of the event buffer handed to `epoll_wait`
    pub reactor_max_events: usize,

    /// Number of fd context slots allocated up front
    pub initial_fd_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            reactor_max_timeout_ms: DEFAULT_REACTOR_MAX_TIMEOUT_MS,
            reactor_max_events: DEFAULT_REACTOR_MAX_EVENTS,
            initial_fd_capacity: DEFAULT_INITIAL_FD_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with any `SPINDLE_*` environment variables
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` on top of `self`.
    ///
    /// Values that fail to parse, or are zero, are ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_positive::<usize>(ENV_FIBER_STACK_SIZE, &lookup) {
            self.fiber_stack_size = v;
        }
        if let Some(v) = parse_positive::<u64>(ENV_REACTOR_MAX_TIMEOUT_MS, &lookup) {
            self.reactor_max_timeout_ms = v;
        }
        if let Some(v) = parse_positive::<usize>(ENV_REACTOR_MAX_EVENTS, &lookup) {
            self.reactor_max_events = v;
        }
        if let Some(v) = parse_positive::<usize>(ENV_INITIAL_FD_CAPACITY, &lookup) {
            self.initial_fd_capacity = v;
        }
        self
    }

    /// The process-wide configuration, read from the environment on first use
    pub fn global() -> &'static RuntimeConfig {
        GLOBAL.get_or_init(Self::from_env)
    }

    /// Install `config` as the process-wide configuration.
    ///
    /// Returns `false` if a configuration was already installed or read.
    pub fn install(config: RuntimeConfig) -> bool {
        GLOBAL.set(config).is_ok()
    }
}

fn parse_positive<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v != T::default() => Some(v),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid runtime setting");
            None
        }
    }
}
