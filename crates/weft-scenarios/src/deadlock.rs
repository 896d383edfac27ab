//! Classic AB/BA deadlock.
//!
//! The child thread locks m1 then m2; the main thread locks m2 then m1.
//! By default the two critical sections are serialized through a plain
//! channel — invisible to the analyzers, so the reversed lock pair is
//! still predicted — which keeps profiling runs deadlock-free. With
//! `serialize` off, the raw race is live and an active scheduler can
//! drive both threads into the cycle.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use weft_core::exec::Controller;

use crate::{Scenario, ScenarioOutcome};

pub struct Deadlock {
    /// Keep the unsteered run deadlock-free.
    pub serialize: bool,
    /// Busy-work instructions inside the nested critical section.
    pub work: u64,
}

impl Default for Deadlock {
    fn default() -> Self {
        Self { serialize: true, work: 200 }
    }
}

impl Scenario for Deadlock {
    fn name(&self) -> &'static str {
        "deadlock"
    }

    fn description(&self) -> &'static str {
        "two threads take the same two locks in opposite orders"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/deadlock");
        let child_lock_m1 = ctrl.registry().intern_inst(&image, 0x10);
        let child_lock_m2 = ctrl.registry().intern_inst(&image, 0x14);
        let child_unlock_m2 = ctrl.registry().intern_inst(&image, 0x18);
        let child_unlock_m1 = ctrl.registry().intern_inst(&image, 0x1c);
        let main_lock_m2 = ctrl.registry().intern_inst(&image, 0x20);
        let main_lock_m1 = ctrl.registry().intern_inst(&image, 0x24);
        let main_unlock_m1 = ctrl.registry().intern_inst(&image, 0x28);
        let main_unlock_m2 = ctrl.registry().intern_inst(&image, 0x2c);

        let m1 = Arc::new(Mutex::new(()));
        let m2 = Arc::new(Mutex::new(()));
        let m1_addr = Arc::as_ptr(&m1) as u64;
        let m2_addr = Arc::as_ptr(&m2) as u64;

        let (start_tx, start_rx) = mpsc::channel::<()>();

        let mut main = ctrl.main_thread();
        let thd = ctrl.create_thread(Some(main.thread_id()));
        let handle = {
            let ctrl = Arc::clone(ctrl);
            let m1 = Arc::clone(&m1);
            let m2 = Arc::clone(&m2);
            let work = self.work;
            let serialize = self.serialize;
            thread::spawn(move || {
                let mut probe = ctrl.probe(thd);
                if serialize {
                    // Wait for the main thread's critical section; the
                    // channel leaves no trace in the event stream.
                    let _ = start_rx.recv();
                }
                let g1 = probe.mutex_lock(&child_lock_m1, m1_addr, || m1.lock().unwrap());
                let g2 = probe.mutex_lock(&child_lock_m2, m2_addr, || m2.lock().unwrap());
                probe.inst_count(work);
                probe.mutex_unlock(&child_unlock_m2, m2_addr, || drop(g2));
                probe.mutex_unlock(&child_unlock_m1, m1_addr, || drop(g1));
                probe.thread_exit();
            })
        };

        let g2 = main.mutex_lock(&main_lock_m2, m2_addr, || m2.lock().unwrap());
        let g1 = main.mutex_lock(&main_lock_m1, m1_addr, || m1.lock().unwrap());
        main.inst_count(self.work);
        main.mutex_unlock(&main_unlock_m1, m1_addr, || drop(g1));
        main.mutex_unlock(&main_unlock_m2, m2_addr, || drop(g2));
        let _ = start_tx.send(());

        main.join(thd, || handle.join().unwrap());
        main.thread_exit();
        ScenarioOutcome {
            summary: "both lock orders completed".into(),
            invariant_violated: false,
        }
    }
}
