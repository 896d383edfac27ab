//! End-to-end prediction runs over the bundled scenarios.
//!
//! The usual workflow needs two profiling runs: the first run teaches the
//! shared-instruction database which instructions touch shared state, the
//! second predicts candidate interleavings from a fully monitored
//! execution. Databases persist in a temp directory between the runs.

use std::sync::Arc;

use weft_core::exec::Controller;
use weft_core::iroot::{EventKind, Idiom};
use weft_core::options::Options;
use weft_scenarios::{
    BankAccount, CircularList, CondSignal, Deadlock, Scenario, SharedCounter, StringBuffer,
};

fn base_options(dir: &tempfile::TempDir) -> Options {
    Options {
        complex_idioms: true,
        db_dir: dir.path().to_path_buf(),
        ..Options::default()
    }
}

/// Profile once to learn shared instructions, then once to predict.
fn profile_twice(scenario: &dyn Scenario, opts: &Options) -> Arc<Controller> {
    let first = Arc::new(Controller::for_prediction(opts));
    scenario.run(&first);
    first.program_exit();
    first.save_databases();

    let second = Arc::new(Controller::for_prediction(opts));
    second.load_databases().expect("reload databases");
    scenario.run(&second);
    second.program_exit();
    second.save_databases();
    second
}

fn predicted_idioms(ctrl: &Controller) -> Vec<Idiom> {
    ctrl.memo()
        .predicted_ids()
        .into_iter()
        .filter_map(|id| ctrl.iroot_db().find_iroot_by_id(id))
        .map(|iroot| iroot.idiom())
        .collect()
}

#[test]
fn shared_counter_predicts_the_lost_update() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = profile_twice(&SharedCounter::default(), &opts);

    let idioms = predicted_idioms(&ctrl);
    assert!(idioms.contains(&Idiom::Idiom1), "got {idioms:?}");
    assert!(idioms.contains(&Idiom::Idiom2), "lost-update shape: {idioms:?}");

    // The idiom-2 candidate is read, remote write, write over the counter.
    let found = ctrl.memo().predicted_ids().into_iter().any(|id| {
        let iroot = ctrl.iroot_db().find_iroot_by_id(id).unwrap();
        iroot.idiom() == Idiom::Idiom2
            && iroot.event(0).kind() == EventKind::MemRead
            && iroot.event(1).kind() == EventKind::MemWrite
            && iroot.event(2).kind() == EventKind::MemWrite
    });
    assert!(found, "expected R -> remote W -> W candidate");
}

#[test]
fn bank_account_predicts_symmetric_atomicity_violations() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = profile_twice(&BankAccount::default(), &opts);

    // Both the deposit and the withdraw side produce an idiom-2 candidate
    // over the balance field.
    let candidates: Vec<_> = ctrl
        .memo()
        .predicted_ids()
        .into_iter()
        .filter_map(|id| ctrl.iroot_db().find_iroot_by_id(id))
        .filter(|iroot| {
            iroot.idiom() == Idiom::Idiom2
                && iroot.event(0).kind() == EventKind::MemRead
                && iroot.event(1).kind() == EventKind::MemWrite
                && iroot.event(2).kind() == EventKind::MemWrite
        })
        .collect();
    assert!(
        candidates.len() >= 2,
        "expected symmetric candidates, got {}",
        candidates.len()
    );
}

#[test]
fn circular_list_predicts_a_two_location_shape() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    // A single node guarantees both threads contend on the same payload.
    let scenario = CircularList { rotations: 2, nodes: 1 };
    let ctrl = profile_twice(&scenario, &opts);

    let idioms = predicted_idioms(&ctrl);
    assert!(idioms.contains(&Idiom::Idiom1), "got {idioms:?}");
    assert!(
        idioms.contains(&Idiom::Idiom4),
        "head/node shape expected: {idioms:?}"
    );
}

#[test]
fn deadlock_predicts_idiom5_with_the_knob() {
    let dir = tempfile::tempdir().unwrap();
    let opts = Options {
        predict_deadlock: true,
        ..base_options(&dir)
    };
    // One run suffices: lock events are never swallowed by the
    // shared-instruction filter.
    let ctrl = Arc::new(Controller::for_prediction(&opts));
    Deadlock::default().run(&ctrl);
    ctrl.program_exit();

    let idioms = predicted_idioms(&ctrl);
    assert!(
        idioms.contains(&Idiom::Idiom5),
        "deadlock shape expected: {idioms:?}"
    );

    // All four events are lock acquisitions.
    let found = ctrl.memo().predicted_ids().into_iter().any(|id| {
        let iroot = ctrl.iroot_db().find_iroot_by_id(id).unwrap();
        iroot.idiom() == Idiom::Idiom5
            && iroot.events().iter().all(|e| e.kind() == EventKind::MutexLock)
    });
    assert!(found, "expected an all-lock idiom-5 candidate");
}

#[test]
fn deadlock_without_the_knob_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = Arc::new(Controller::for_prediction(&opts));
    Deadlock::default().run(&ctrl);
    ctrl.program_exit();

    let all_lock_idiom5 = ctrl.memo().predicted_ids().into_iter().any(|id| {
        let iroot = ctrl.iroot_db().find_iroot_by_id(id).unwrap();
        iroot.idiom() == Idiom::Idiom5
            && iroot.events().iter().all(|e| e.kind() == EventKind::MutexLock)
    });
    assert!(!all_lock_idiom5);
}

#[test]
fn cond_signal_predicts_no_memory_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = Arc::new(Controller::for_profile(&opts));
    let outcome = CondSignal.run(&ctrl);
    ctrl.program_exit();
    assert!(!outcome.invariant_violated, "handshake must succeed");

    // The signal ordered the flag write before the wake-side reads: no
    // memory candidate survives, only reorderable lock pairs remain.
    for id in ctrl.memo().predicted_ids() {
        let iroot = ctrl.iroot_db().find_iroot_by_id(id).unwrap();
        assert!(
            iroot.events().iter().all(|e| e.kind().is_sync()),
            "spurious memory candidate: {}",
            iroot.to_display_string()
        );
    }

    // Nothing fired either: the observer knows no iRoots in a fresh run.
    for idiom in Idiom::PRIORITY {
        assert_eq!(ctrl.memo().total_exposed(idiom, true), 0);
    }
}

#[test]
fn string_buffer_predicts_a_reversed_pair_over_count_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = profile_twice(&StringBuffer, &opts);

    let idioms = predicted_idioms(&ctrl);
    assert!(idioms.contains(&Idiom::Idiom1), "got {idioms:?}");
    assert!(
        idioms.contains(&Idiom::Idiom5),
        "count/data crossover expected: {idioms:?}"
    );
}

#[test]
fn profiled_databases_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let opts = base_options(&dir);
    let ctrl = profile_twice(&SharedCounter::default(), &opts);
    let iroots_before = ctrl.iroot_db().iroot_count();
    let predicted_before = ctrl.memo().total_predicted();

    let reloaded = Arc::new(Controller::new(&opts));
    reloaded.load_databases().unwrap();
    assert_eq!(reloaded.iroot_db().iroot_count(), iroots_before);
    assert_eq!(reloaded.memo().total_predicted(), predicted_before);
}
