//! Full-pipeline test at the library level: predict candidates from a
//! synthetic event stream, pick one from the memo, steer a re-run toward
//! it with a scripted schedule, and check the databases along the way.

use std::sync::Arc;

use weft_core::exec::{Controller, Steering};
use weft_core::iroot::{EventKind, Idiom};
use weft_core::options::Options;
use weft_core::sched::{ActiveScheduler, FakeControl, PriorityBands, PriorityControl};

#[test]
fn predict_choose_steer_expose() {
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        complex_idioms: true,
        db_dir: dir.path().to_path_buf(),
        ..Options::default()
    };

    // Run 1: two threads race on one cell; the predictor extrapolates.
    let ctrl = Arc::new(Controller::for_prediction(&opts));
    let image = ctrl.registry().intern_image("/usr/bin/app");
    let inst_read = ctrl.registry().intern_inst(&image, 0x10);
    let inst_write = ctrl.registry().intern_inst(&image, 0x14);
    // Seed the shared-instruction database as an earlier run would have.
    ctrl.sinst_db().set_shared(&inst_read);
    ctrl.sinst_db().set_shared(&inst_write);

    let cell = 0x1000;
    let mut main = ctrl.main_thread();
    main.region_alloc(cell, 4);
    let t1 = ctrl.create_thread(Some(main.thread_id()));
    let t2 = ctrl.create_thread(Some(main.thread_id()));
    let mut p1 = ctrl.probe(t1);
    let mut p2 = ctrl.probe(t2);
    p1.mem_read(&inst_read, cell, 4, || ());
    p1.mem_write(&inst_write, cell, 4, || ());
    p2.mem_read(&inst_read, cell, 4, || ());
    p2.mem_write(&inst_write, cell, 4, || ());
    p1.thread_exit();
    p2.thread_exit();
    main.thread_exit();
    ctrl.program_exit();
    ctrl.save_databases();

    assert!(ctrl.memo().total_candidates() > 0);

    // Offline: reload and choose a candidate, simplest idiom first.
    let ctrl2 = Arc::new(Controller::new(&opts));
    ctrl2.load_databases().unwrap();
    let candidate = ctrl2.memo().choose_for_test().expect("candidate available");
    assert_eq!(candidate.idiom(), Idiom::Idiom1);

    // Pick the read -> remote-write candidate specifically.
    let target = ctrl2
        .iroot_db()
        .iroots()
        .into_iter()
        .find(|r| {
            r.idiom() == Idiom::Idiom1
                && r.event(0).kind() == EventKind::MemRead
                && r.event(1).kind() == EventKind::MemWrite
        })
        .expect("read->write candidate");

    // Run 2: steer a scripted schedule into the target order.
    let control = Arc::new(FakeControl::new());
    let sched = Arc::new(ActiveScheduler::new(
        &opts,
        Arc::clone(&target),
        Arc::clone(ctrl2.memo()),
        Arc::clone(&control) as Arc<dyn PriorityControl>,
        PriorityBands::from_options(&opts)
            .shuffled_new_thread_pool(&mut <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(1)),
    ));
    ctrl2.set_steering(Arc::clone(&sched) as Arc<dyn Steering>);

    let inst_read = ctrl2.registry().find_inst(target.event(0).inst().id()).unwrap();
    let inst_write = ctrl2.registry().find_inst(target.event(1).inst().id()).unwrap();
    let mut main = ctrl2.main_thread();
    main.region_alloc(cell, 4);
    let t1 = ctrl2.create_thread(Some(main.thread_id()));
    let t2 = ctrl2.create_thread(Some(main.thread_id()));
    let mut p1 = ctrl2.probe(t1);
    let mut p2 = ctrl2.probe(t2);
    p1.mem_read(&inst_read, cell, 4, || ());
    p2.mem_write(&inst_write, cell, 4, || ());
    p1.thread_exit();
    p2.thread_exit();
    main.thread_exit();
    ctrl2.program_exit();

    assert!(sched.exposed(), "scripted schedule hits the target order");
    assert!(ctrl2.memo().is_exposed(&target));

    // The exposure survives another save/load cycle.
    ctrl2.save_databases();
    let ctrl3 = Arc::new(Controller::new(&opts));
    ctrl3.load_databases().unwrap();
    let reloaded = ctrl3.iroot_db().find_iroot_by_id(target.id()).unwrap();
    assert!(ctrl3.memo().is_exposed(&reloaded));
}
