//! `spindle fibers`: fibers taking turns on a scheduler.

use std::sync::Arc;

use anyhow::Context;
use spindle::{Fiber, FiberState, Scheduler};

pub fn execute(count: usize, rounds: usize, threads: usize, use_caller: bool) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(threads, use_caller, "fibers").context("creating scheduler")?;

    let mut fibers: Vec<Arc<Fiber>> = Vec::with_capacity(count);
    for n in 0..count {
        let fiber = Fiber::new(
            move || {
                for round in 0..rounds {
                    println!(
                        "fiber {} (#{}) round {} on {:?}",
                        n,
                        Fiber::current_id(),
                        round,
                        std::thread::current().name().unwrap_or("caller")
                    );
                    Fiber::yield_to_ready();
                }
            },
            0,
            false,
        )
        .context("creating fiber")?;
        scheduler.schedule_fiber(fiber.clone());
        fibers.push(fiber);
    }

    scheduler.start().context("starting workers")?;
    println!("{}", scheduler.stats());
    scheduler.stop();

    let failed = fibers
        .iter()
        .filter(|f| f.state() == FiberState::Except)
        .count();
    drop(fibers);
    println!(
        "{} fibers finished, {} failed, {} fibers left alive",
        count - failed,
        failed,
        Fiber::total()
    );
    Ok(())
}
