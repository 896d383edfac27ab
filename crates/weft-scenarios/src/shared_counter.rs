//! Unsynchronized shared counter — the classic lost update.
//!
//! Two threads each run `temp = g; temp += 1; g = temp` with no lock. An
//! unlucky schedule interleaves the read of one thread between the read
//! and write of the other, losing an increment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use weft_core::exec::Controller;

use crate::{Scenario, ScenarioOutcome};

/// Lost-update shared counter.
pub struct SharedCounter {
    /// Increments performed by each thread.
    pub iterations: u32,
    /// Number of incrementing threads.
    pub num_threads: u32,
}

impl Default for SharedCounter {
    fn default() -> Self {
        Self { iterations: 2, num_threads: 2 }
    }
}

impl Scenario for SharedCounter {
    fn name(&self) -> &'static str {
        "shared_counter"
    }

    fn description(&self) -> &'static str {
        "two threads increment a global counter without a lock"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/shared_counter");
        let inst_read = ctrl.registry().intern_inst(&image, 0x10);
        let inst_write = ctrl.registry().intern_inst(&image, 0x14);

        let counter = Arc::new(AtomicU32::new(0));
        let addr = Arc::as_ptr(&counter) as u64;

        let mut main = ctrl.main_thread();
        main.region_alloc(addr, 4);

        let mut handles = Vec::new();
        for _ in 0..self.num_threads {
            let thd = ctrl.create_thread(Some(main.thread_id()));
            let ctrl = Arc::clone(ctrl);
            let counter = Arc::clone(&counter);
            let inst_read = Arc::clone(&inst_read);
            let inst_write = Arc::clone(&inst_write);
            let iterations = self.iterations;
            handles.push((thd, thread::spawn(move || {
                let mut probe = ctrl.probe(thd);
                for _ in 0..iterations {
                    let temp = probe.mem_read(&inst_read, addr, 4, || {
                        counter.load(Ordering::Relaxed)
                    });
                    probe.inst_count(1);
                    probe.mem_write(&inst_write, addr, 4, || {
                        counter.store(temp + 1, Ordering::Relaxed)
                    });
                }
                probe.thread_exit();
            })));
        }
        for (thd, handle) in handles {
            main.join(thd, || handle.join().unwrap());
        }

        let expected = self.num_threads * self.iterations;
        let finale = counter.load(Ordering::Relaxed);
        main.region_free(addr);
        main.thread_exit();
        ScenarioOutcome {
            summary: format!("counter = {finale}, expected {expected}"),
            invariant_violated: finale != expected,
        }
    }
}
