//! Cond-var signal handshake — the healthy control scenario.
//!
//! The waiter blocks on a condition variable until the signaler has set
//! the flag under the same lock. The signal orders the flag write before
//! the post-wait read, so no candidate may be predicted against that
//! order; a run without a lost signal fires no known iRoot at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use weft_core::exec::Controller;

use crate::{Scenario, ScenarioOutcome};

#[derive(Default)]
pub struct CondSignal;

impl Scenario for CondSignal {
    fn name(&self) -> &'static str {
        "cond_signal"
    }

    fn description(&self) -> &'static str {
        "a correctly ordered cond-var handshake; nothing should be exposed"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/cond_signal");
        let wait_lock = ctrl.registry().intern_inst(&image, 0x10);
        let loop_read = ctrl.registry().intern_inst(&image, 0x14);
        let wait_inst = ctrl.registry().intern_inst(&image, 0x18);
        let post_read = ctrl.registry().intern_inst(&image, 0x1c);
        let wait_unlock = ctrl.registry().intern_inst(&image, 0x20);
        let sig_lock = ctrl.registry().intern_inst(&image, 0x24);
        let sig_write = ctrl.registry().intern_inst(&image, 0x28);
        let sig_signal = ctrl.registry().intern_inst(&image, 0x2c);
        let sig_unlock = ctrl.registry().intern_inst(&image, 0x30);

        let lock = Arc::new(Mutex::new(()));
        let cond = Arc::new(Condvar::new());
        let signaled = Arc::new(AtomicBool::new(false));
        let lock_addr = Arc::as_ptr(&lock) as u64;
        let cond_addr = Arc::as_ptr(&cond) as u64;
        let flag_addr = Arc::as_ptr(&signaled) as u64;

        let mut main = ctrl.main_thread();
        main.region_alloc(flag_addr, 1);

        // Waiter.
        let waiter_thd = ctrl.create_thread(Some(main.thread_id()));
        let waiter = {
            let ctrl = Arc::clone(ctrl);
            let lock = Arc::clone(&lock);
            let cond = Arc::clone(&cond);
            let signaled = Arc::clone(&signaled);
            let wait_lock = Arc::clone(&wait_lock);
            let loop_read = Arc::clone(&loop_read);
            let wait_inst = Arc::clone(&wait_inst);
            let post_read = Arc::clone(&post_read);
            let wait_unlock = Arc::clone(&wait_unlock);
            thread::spawn(move || {
                let mut probe = ctrl.probe(waiter_thd);
                let mut guard =
                    probe.mutex_lock(&wait_lock, lock_addr, || lock.lock().unwrap());
                while !probe.mem_read(&loop_read, flag_addr, 1, || {
                    signaled.load(Ordering::Relaxed)
                }) {
                    guard = probe.cond_wait(&wait_inst, cond_addr, lock_addr, false, || {
                        cond.wait(guard).unwrap()
                    });
                }
                let seen = probe.mem_read(&post_read, flag_addr, 1, || {
                    signaled.load(Ordering::Relaxed)
                });
                probe.mutex_unlock(&wait_unlock, lock_addr, || drop(guard));
                probe.thread_exit();
                seen
            })
        };

        // Signaler.
        let signaler_thd = ctrl.create_thread(Some(main.thread_id()));
        let signaler = {
            let ctrl = Arc::clone(ctrl);
            let lock = Arc::clone(&lock);
            let cond = Arc::clone(&cond);
            let signaled = Arc::clone(&signaled);
            let sig_lock = Arc::clone(&sig_lock);
            let sig_write = Arc::clone(&sig_write);
            let sig_signal = Arc::clone(&sig_signal);
            let sig_unlock = Arc::clone(&sig_unlock);
            thread::spawn(move || {
                let mut probe = ctrl.probe(signaler_thd);
                let guard = probe.mutex_lock(&sig_lock, lock_addr, || lock.lock().unwrap());
                probe.mem_write(&sig_write, flag_addr, 1, || {
                    signaled.store(true, Ordering::Relaxed)
                });
                probe.cond_signal(&sig_signal, cond_addr, || cond.notify_one());
                probe.mutex_unlock(&sig_unlock, lock_addr, || drop(guard));
                probe.thread_exit();
            })
        };

        let seen = main.join(waiter_thd, || waiter.join().unwrap());
        main.join(signaler_thd, || signaler.join().unwrap());
        main.region_free(flag_addr);
        main.thread_exit();
        ScenarioOutcome {
            summary: format!("waiter observed signaled = {seen}"),
            invariant_violated: !seen,
        }
    }
}
