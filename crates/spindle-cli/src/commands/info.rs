//! `spindle info`: Display the runtime configuration and environment.

use spindle::RuntimeConfig;

const ENV_VARS: [&str; 4] = [
    "SPINDLE_FIBER_STACK_SIZE",
    "SPINDLE_REACTOR_MAX_TIMEOUT_MS",
    "SPINDLE_REACTOR_MAX_EVENTS",
    "SPINDLE_INITIAL_FD_CAPACITY",
];

pub fn execute() -> anyhow::Result<()> {
    println!("Spindle v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Platform:     {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    println!("CPUs:         {}", std::thread::available_parallelism().map_or(1, |n| n.get()));

    let config = RuntimeConfig::global();
    println!();
    println!("Runtime:");
    println!("  fiber stack size:     {} bytes", config.fiber_stack_size);
    println!("  reactor max timeout:  {} ms", config.reactor_max_timeout_ms);
    println!("  reactor max events:   {}", config.reactor_max_events);
    println!("  initial fd capacity:  {}", config.initial_fd_capacity);

    println!();
    println!("Environment:");
    for var in ENV_VARS {
        match std::env::var(var) {
            Ok(val) => println!("  {}={}", var, val),
            Err(_) => println!("  {} (not set)", var),
        }
    }

    Ok(())
}
