//! `spindle timers`: one-shot and recurring timers on the reactor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam::channel;
use spindle::IoManager;

pub fn execute(once_ms: u64, every_ms: u64, ticks: usize) -> anyhow::Result<()> {
    let io = IoManager::new(1, false, "timers").context("creating reactor")?;
    let started = Instant::now();

    io.add_timer(
        once_ms,
        move || println!("[{:>5} ms] one-shot fired", started.elapsed().as_millis()),
        false,
    );

    let (done_tx, done_rx) = channel::bounded(1);
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let recurring = io.add_timer(
        every_ms,
        move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[{:>5} ms] tick {}", started.elapsed().as_millis(), n);
            if n == ticks {
                let _ = done_tx.try_send(());
            }
        },
        true,
    );

    let budget = Duration::from_millis(every_ms.saturating_mul(ticks as u64 + 1) + 5000);
    let finished = ticks == 0 || done_rx.recv_timeout(budget).is_ok();
    recurring.cancel();
    io.stop();

    anyhow::ensure!(finished, "recurring timer did not reach {} ticks", ticks);
    println!(
        "recurring timer ticked {} times in {} ms",
        count.load(Ordering::SeqCst),
        started.elapsed().as_millis()
    );
    Ok(())
}
