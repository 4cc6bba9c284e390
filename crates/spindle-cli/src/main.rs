//! Spindle command-line driver
//!
//! Small demonstrations of the fiber runtime: fibers trading control on a
//! scheduler, timers on the reactor, and pipe readiness wake-ups.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Stackful fiber runtime playground", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run fibers that repeatedly yield to each other
    Fibers {
        /// Number of fibers
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
        /// Yields per fiber
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
        /// Worker threads (0 = one per CPU)
        #[arg(short, long, default_value_t = 1)]
        threads: usize,
        /// Let the calling thread act as a worker
        #[arg(long)]
        use_caller: bool,
    },

    /// Arm one-shot and recurring timers on the reactor
    Timers {
        /// Delay of the one-shot timer in milliseconds
        #[arg(long, default_value_t = 500)]
        once_ms: u64,
        /// Period of the recurring timer in milliseconds
        #[arg(long, default_value_t = 100)]
        every_ms: u64,
        /// Cancel the recurring timer after this many ticks
        #[arg(long, default_value_t = 5)]
        ticks: usize,
    },

    /// Bounce bytes between two fibers over a pair of pipes
    Pipe {
        /// Number of round trips
        #[arg(short, long, default_value_t = 1000)]
        rounds: u32,
        /// Worker threads (0 = one per CPU)
        #[arg(short, long, default_value_t = 2)]
        threads: usize,
    },

    /// Show the effective runtime configuration
    Info,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Fibers {
            count,
            rounds,
            threads,
            use_caller,
        } => commands::fibers::execute(count, rounds, threads, use_caller),

        Commands::Timers {
            once_ms,
            every_ms,
            ticks,
        } => commands::timers::execute(once_ms, every_ms, ticks),

        Commands::Pipe { rounds, threads } => commands::pipe::execute(rounds, threads),

        Commands::Info => commands::info::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
