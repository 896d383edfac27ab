//! End-to-end active-scheduling runs with the cooperative backend.
//!
//! These drive a real multithreaded scenario toward a chosen iRoot using
//! the in-process priority emulation, so they need no realtime
//! privileges. The deadlock test intentionally leaves two blocked threads
//! behind; the process reaps them at exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::exec::{Controller, Steering};
use weft_core::iroot::{EventKind, Idiom, Iroot};
use weft_core::memo::Memo;
use weft_core::options::Options;
use weft_core::sched::{ActiveScheduler, CoopControl, PriorityControl};
use weft_scenarios::{Deadlock, Scenario, SharedCounter};

struct ActiveRig {
    ctrl: Arc<Controller>,
    sched: Arc<ActiveScheduler>,
}

fn active_rig(opts: &Options, iroot: Arc<Iroot>, memo: Arc<Memo>, ctrl: Arc<Controller>) -> ActiveRig {
    let control: Arc<dyn PriorityControl> =
        Arc::new(CoopControl::with_park_limit(Duration::from_secs(2)));
    let sched = Arc::new(ActiveScheduler::new(
        opts,
        iroot,
        memo,
        control,
        vec![60, 65, 70, 75],
    ));
    ctrl.set_steering(Arc::clone(&sched) as Arc<dyn Steering>);
    ActiveRig { ctrl, sched }
}

#[test]
fn shared_counter_exposes_the_lost_update() {
    let opts = Options::default();
    let ctrl = Arc::new(Controller::new(&opts));

    // The candidate a prediction run would have produced: read, remote
    // write, write over the counter cell.
    let image = ctrl.registry().intern_image("scenario/shared_counter");
    let inst_read = ctrl.registry().intern_inst(&image, 0x10);
    let inst_write = ctrl.registry().intern_inst(&image, 0x14);
    let e0 = ctrl.iroot_db().get_event(&inst_read, EventKind::MemRead);
    let e1 = ctrl.iroot_db().get_event(&inst_write, EventKind::MemWrite);
    let e2 = ctrl.iroot_db().get_event(&inst_write, EventKind::MemWrite);
    let iroot = ctrl.iroot_db().get_iroot(Idiom::Idiom2, &[e0, e1, e2]);
    ctrl.memo().predicted(&iroot);

    let rig = active_rig(&opts, Arc::clone(&iroot), Arc::clone(ctrl.memo()), Arc::clone(&ctrl));

    let scenario = SharedCounter { iterations: 1, num_threads: 2 };
    let outcome = scenario.run(&rig.ctrl);
    rig.ctrl.program_exit();

    assert!(rig.sched.exposed(), "scheduler should reach the target order");
    assert!(rig.ctrl.memo().is_exposed(&iroot));
    assert!(
        outcome.invariant_violated,
        "one increment must be lost: {}",
        outcome.summary
    );
    assert!(outcome.summary.contains("counter = 1"), "{}", outcome.summary);
}

#[test]
fn deadlock_is_driven_into_the_cycle() {
    let opts = Options::default();
    let ctrl = Arc::new(Controller::new(&opts));

    // The deadlock-shaped candidate: child takes m1 then m2, main takes
    // m2 then m1; outer pair over m1, inner pair over m2.
    let image = ctrl.registry().intern_image("scenario/deadlock");
    let child_lock_m1 = ctrl.registry().intern_inst(&image, 0x10);
    let child_lock_m2 = ctrl.registry().intern_inst(&image, 0x14);
    let main_lock_m2 = ctrl.registry().intern_inst(&image, 0x20);
    let main_lock_m1 = ctrl.registry().intern_inst(&image, 0x24);
    let e0 = ctrl.iroot_db().get_event(&child_lock_m1, EventKind::MutexLock);
    let e1 = ctrl.iroot_db().get_event(&main_lock_m1, EventKind::MutexLock);
    let e2 = ctrl.iroot_db().get_event(&main_lock_m2, EventKind::MutexLock);
    let e3 = ctrl.iroot_db().get_event(&child_lock_m2, EventKind::MutexLock);
    let iroot = ctrl.iroot_db().get_iroot(Idiom::Idiom5, &[e0, e1, e2, e3]);
    ctrl.memo().predicted(&iroot);

    let rig = active_rig(&opts, Arc::clone(&iroot), Arc::clone(ctrl.memo()), Arc::clone(&ctrl));

    // Run the raw AB/BA race on a worker; on success it never finishes.
    let worker = {
        let ctrl = Arc::clone(&rig.ctrl);
        std::thread::spawn(move || {
            Deadlock { serialize: false, work: 10 }.run(&ctrl);
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while !rig.sched.exposed() && Instant::now() < deadline && !worker.is_finished() {
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(rig.sched.exposed(), "both threads should block inside the cycle");
    rig.sched.conclude();
    assert!(rig.ctrl.memo().is_exposed(&iroot));
    // The worker is deadlocked by design; it is not joined.
}

#[test]
fn unrelated_candidate_leaves_the_run_unsteered() {
    let opts = Options::default();
    let ctrl = Arc::new(Controller::new(&opts));

    // A candidate over instructions the scenario never executes.
    let image = ctrl.registry().intern_image("scenario/other");
    let a = ctrl.registry().intern_inst(&image, 0x90);
    let b = ctrl.registry().intern_inst(&image, 0x94);
    let e0 = ctrl.iroot_db().get_event(&a, EventKind::MemRead);
    let e1 = ctrl.iroot_db().get_event(&b, EventKind::MemWrite);
    let iroot = ctrl.iroot_db().get_iroot(Idiom::Idiom1, &[e0, e1]);
    ctrl.memo().predicted(&iroot);

    let rig = active_rig(&opts, Arc::clone(&iroot), Arc::clone(ctrl.memo()), Arc::clone(&ctrl));
    let outcome = SharedCounter::default().run(&rig.ctrl);
    rig.ctrl.program_exit();

    assert!(!rig.sched.exposed());
    assert!(rig.ctrl.memo().is_failed(&iroot) || !rig.ctrl.memo().is_exposed(&iroot));
    // The run itself completed normally.
    assert!(outcome.summary.starts_with("counter ="));
}
