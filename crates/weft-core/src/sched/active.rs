//! The active scheduler: drive one run toward one chosen iRoot.
//!
//! Only the iRoot's own instructions act as *target* events; every other
//! monitored access is a *watch* event, consulted only while the current
//! state has a watch armed. The scheduler holds threads back by demoting
//! their priority (the gate after each probe callback deschedules them)
//! and promotes the rest, so the target events fire in the target order
//! on the target threads within the vulnerability window.
//!
//! Transitions happen on three inputs: target-event callbacks (before the
//! operation executes, and after it completes), watch callbacks, and
//! instruction-count ticks that shrink the active window. A give-up path
//! wakes every delayed thread and re-arms from `Init`; after the watch
//! budget is spent the scheduler goes passive and the run counts as a
//! failed test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::event::{Address, ThreadId};
use crate::exec::Steering;
use crate::iroot::{EventKind, Idiom, Iroot};
use crate::memo::Memo;
use crate::options::Options;
use crate::registry::Inst;
use crate::sched::status::{
    consume_window, Idiom1State, Idiom1Status, Idiom2State, Idiom2Status, Idiom3State,
    Idiom3Status, Idiom4State, Idiom4Status, Idiom5State, Idiom5Status,
};
use crate::sched::{PriorityBands, PriorityControl};

/// Give-up attempts allowed before the scheduler goes passive.
const DEFAULT_WATCH_BUDGET: u32 = 8;

enum Machine {
    I1(Idiom1Status),
    I2(Idiom2Status),
    I3(Idiom3Status),
    I4(Idiom4Status),
    I5(Idiom5Status),
}

struct Misc {
    alive: HashSet<ThreadId>,
    pool: Vec<i32>,
    pool_cursor: usize,
    lock_owner: HashMap<Address, ThreadId>,
    boosted: HashMap<ThreadId, i32>,
    priorities: HashMap<ThreadId, i32>,
    pending: HashMap<ThreadId, usize>,
    attempts: u32,
    active: bool,
}

/// Deferred priority actions, applied after the state lock is released.
enum Act {
    Prio(ThreadId, i32),
    ParkSelf,
}

/// Steers one run toward `iroot`.
pub struct ActiveScheduler {
    iroot: Arc<Iroot>,
    memo: Arc<Memo>,
    control: Arc<dyn PriorityControl>,
    bands: PriorityBands,
    vw: u64,
    watch_budget: u32,
    machine: Mutex<Machine>,
    misc: Mutex<Misc>,
    started: AtomicBool,
    success: AtomicBool,
    concluded: AtomicBool,
}

impl ActiveScheduler {
    pub fn new(
        opts: &Options,
        iroot: Arc<Iroot>,
        memo: Arc<Memo>,
        control: Arc<dyn PriorityControl>,
        new_thread_pool: Vec<i32>,
    ) -> Self {
        let machine = match iroot.idiom() {
            Idiom::Idiom1 => Machine::I1(Idiom1Status::new()),
            Idiom::Idiom2 => Machine::I2(Idiom2Status::new()),
            Idiom::Idiom3 => Machine::I3(Idiom3Status::new()),
            Idiom::Idiom4 => Machine::I4(Idiom4Status::new()),
            Idiom::Idiom5 => Machine::I5(Idiom5Status::new()),
        };
        info!("active scheduler targeting {}", iroot.to_display_string());
        Self {
            iroot,
            memo,
            control,
            bands: PriorityBands::from_options(opts),
            vw: opts.vw,
            watch_budget: DEFAULT_WATCH_BUDGET,
            machine: Mutex::new(machine),
            misc: Mutex::new(Misc {
                alive: HashSet::new(),
                pool: new_thread_pool,
                pool_cursor: 0,
                lock_owner: HashMap::new(),
                boosted: HashMap::new(),
                priorities: HashMap::new(),
                pending: HashMap::new(),
                attempts: 0,
                active: true,
            }),
            started: AtomicBool::new(false),
            success: AtomicBool::new(false),
            concluded: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Arc<Iroot> {
        &self.iroot
    }

    /// Whether the target interleaving has been driven to completion.
    pub fn exposed(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    /// Record the test outcome into the memo; idempotent. Called from
    /// `program_exit`, or by a watchdog when the run deadlocked on
    /// purpose.
    pub fn conclude(&self) {
        if self.concluded.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.exposed() {
            info!("test success: iroot {}", self.iroot.id());
            self.memo.test_success(&self.iroot);
        } else {
            info!("test fail: iroot {}", self.iroot.id());
            self.memo.test_fail(&self.iroot);
        }
    }

    fn target_indices(&self, inst: &Arc<Inst>, kind: EventKind) -> Vec<usize> {
        self.iroot
            .events()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.inst().id() == inst.id() && e.kind() == kind)
            .map(|(i, _)| i)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Priority plumbing
    // -----------------------------------------------------------------------

    fn apply(&self, thd: ThreadId, acts: Vec<Act>) {
        let mut park = false;
        for act in acts {
            match act {
                Act::Prio(t, p) => {
                    self.misc.lock().unwrap().priorities.insert(t, p);
                    self.control.set_priority(t, p);
                }
                Act::ParkSelf => park = true,
            }
        }
        if park {
            self.control.yield_point(thd);
        }
    }

    /// Promote every live thread except `except` to the higher band.
    fn promote_others(&self, except: ThreadId, acts: &mut Vec<Act>) {
        let misc = self.misc.lock().unwrap();
        for &t in &misc.alive {
            if t != except {
                acts.push(Act::Prio(t, self.bands.higher));
            }
        }
    }

    /// Return every live thread to the normal band.
    fn wake_all(&self, acts: &mut Vec<Act>) {
        let misc = self.misc.lock().unwrap();
        for &t in &misc.alive {
            acts.push(Act::Prio(t, self.bands.normal));
        }
    }

    /// Count a failed attempt; deactivate once the budget is spent.
    fn spend_attempt(&self) {
        let mut misc = self.misc.lock().unwrap();
        misc.attempts += 1;
        if misc.attempts >= self.watch_budget {
            misc.active = false;
            debug!("active scheduler passive after {} attempts", misc.attempts);
        }
    }

    fn is_active(&self) -> bool {
        self.misc.lock().unwrap().active && self.started.load(Ordering::SeqCst)
    }

    fn mark_success(&self, acts: &mut Vec<Act>) {
        self.success.store(true, Ordering::SeqCst);
        self.wake_all(acts);
    }

    // -----------------------------------------------------------------------
    // Idiom 1
    // -----------------------------------------------------------------------

    fn i1_reset(&self, st: &mut Idiom1Status, acts: &mut Vec<Act>) {
        debug!("idiom1: {} -> Init", st.state);
        st.state = Idiom1State::Init;
        st.events.iter_mut().for_each(|e| e.clear());
        st.delay_set.clear();
        st.window = 0;
        self.wake_all(acts);
        self.spend_attempt();
    }

    fn i1_before(
        &self,
        st: &mut Idiom1Status,
        thd: ThreadId,
        idx: usize,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) -> bool {
        match (st.state, idx) {
            (Idiom1State::Init, 0) => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom1State::Init, 1) => {
                // The second event arrived first: hold it until some other
                // thread delivers the first one.
                st.events[1].bind(thd, addr, size);
                st.state = Idiom1State::E1;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom1State::E1, 0) if Some(thd) != st.events[1].thd => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom1State::E0, 1) if Some(thd) != st.events[0].thd => {
                if st.events[0].overlaps(addr, size) {
                    debug!("idiom1: E0 -> E0E1");
                    st.state = Idiom1State::E0E1;
                    st.events[1].bind(thd, addr, size);
                    st.delay_set.clear();
                    self.wake_all(acts);
                    true
                } else {
                    false
                }
            }
            (Idiom1State::E0, 1) => {
                // The held thread reached the second event itself; the
                // pair cannot fire across threads this attempt.
                st.state = Idiom1State::E0WatchX;
                self.i1_reset(st, acts);
                false
            }
            _ => false,
        }
    }

    fn i1_after(&self, st: &mut Idiom1Status, thd: ThreadId, idx: usize, acts: &mut Vec<Act>) {
        match (st.state, idx) {
            (Idiom1State::Init, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom1: Init -> E0");
                st.state = Idiom1State::E0;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom1State::E1, 0) => {
                if st.events[1].overlaps(st.events[0].addr, st.events[0].size) {
                    debug!("idiom1: E1 -> E0E1");
                    st.state = Idiom1State::E0E1;
                    st.delay_set.clear();
                    self.wake_all(acts);
                } else {
                    st.events[0].clear();
                }
            }
            (Idiom1State::E0E1, 1) => {
                debug!("idiom1: E0E1 -> Done");
                st.state = Idiom1State::Done;
                self.mark_success(acts);
            }
            _ => {}
        }
    }

    fn i1_watch(
        &self,
        st: &mut Idiom1Status,
        thd: ThreadId,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) {
        match st.state {
            Idiom1State::E0 => {
                if st.events[0].overlaps(addr, size) && Some(thd) != st.events[0].thd {
                    debug!("idiom1: E0 -> E0Watch");
                    st.state = Idiom1State::E0Watch;
                }
            }
            Idiom1State::E0Watch => {
                if st.events[0].overlaps(addr, size) {
                    st.state = Idiom1State::E0WatchX;
                    self.i1_reset(st, acts);
                }
            }
            _ => {}
        }
    }

    fn i1_tick(&self, st: &mut Idiom1Status, thd: ThreadId, n: u64, acts: &mut Vec<Act>) {
        let holder = match st.state {
            Idiom1State::E0 | Idiom1State::E0Watch => st.events[0].thd,
            Idiom1State::E1 => st.events[1].thd,
            _ => return,
        };
        if Some(thd) == holder {
            return;
        }
        if consume_window(&mut st.window, n) {
            match st.state {
                Idiom1State::E0 | Idiom1State::E0Watch => {
                    st.state = Idiom1State::E0WatchX;
                    self.i1_reset(st, acts);
                }
                Idiom1State::E1 => self.i1_reset(st, acts),
                _ => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Idiom 2
    // -----------------------------------------------------------------------

    fn i2_reset(&self, st: &mut Idiom2Status, acts: &mut Vec<Act>) {
        debug!("idiom2: {} -> Init", st.state);
        st.state = Idiom2State::Init;
        st.events.iter_mut().for_each(|e| e.clear());
        st.delay_set.clear();
        st.window = 0;
        self.wake_all(acts);
        self.spend_attempt();
    }

    fn i2_before(
        &self,
        st: &mut Idiom2Status,
        thd: ThreadId,
        idx: usize,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) -> bool {
        match (st.state, idx) {
            (Idiom2State::Init, 0) => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom2State::Init, 1) => {
                st.events[1].bind(thd, addr, size);
                st.state = Idiom2State::E1;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom2State::E1, 0) if Some(thd) != st.events[1].thd => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom2State::E0, 1) if Some(thd) != st.events[0].thd => {
                if st.events[0].overlaps(addr, size) {
                    st.events[1].bind(thd, addr, size);
                    true
                } else {
                    false
                }
            }
            (Idiom2State::E0, 2) if st.events[0].thd == Some(thd) => {
                // The held thread reached its closing event before the
                // remote one; this attempt is dead.
                st.state = Idiom2State::E0WatchX;
                self.i2_reset(st, acts);
                false
            }
            (Idiom2State::E0E1, 2) if st.events[0].thd == Some(thd) => {
                if st.events[0].overlaps(addr, size) {
                    st.events[2].bind(thd, addr, size);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn i2_after(&self, st: &mut Idiom2Status, thd: ThreadId, idx: usize, acts: &mut Vec<Act>) {
        match (st.state, idx) {
            (Idiom2State::Init, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom2: Init -> E0");
                st.state = Idiom2State::E0;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom2State::E1, 0) if st.events[0].thd == Some(thd) => {
                if st.events[1].overlaps(st.events[0].addr, st.events[0].size) {
                    debug!("idiom2: E1 -> E0");
                    st.state = Idiom2State::E0;
                    st.window = self.vw;
                    // The remote thread is free to deliver its event now;
                    // the opening thread waits for it.
                    st.delay_set.clear();
                    self.wake_all(acts);
                    st.delay_set.insert(thd);
                    acts.push(Act::Prio(thd, self.bands.lower));
                    acts.push(Act::ParkSelf);
                } else {
                    st.events[0].clear();
                }
            }
            (Idiom2State::E0, 1) if st.events[1].thd == Some(thd) => {
                debug!("idiom2: E0 -> E0E1");
                st.state = Idiom2State::E0E1;
                st.window = self.vw;
                st.delay_set.clear();
                self.wake_all(acts);
            }
            (Idiom2State::E0E1, 2) => {
                debug!("idiom2: E0E1 -> E0E1E2 -> Done");
                st.state = Idiom2State::E0E1E2;
                st.state = Idiom2State::Done;
                self.mark_success(acts);
            }
            _ => {}
        }
    }

    fn i2_watch(
        &self,
        st: &mut Idiom2Status,
        thd: ThreadId,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) {
        let hits_target = st.events[0].overlaps(addr, size);
        match st.state {
            Idiom2State::E0 => {
                if hits_target && Some(thd) != st.events[0].thd {
                    st.state = Idiom2State::E0Watch;
                }
            }
            Idiom2State::E0Watch => {
                if hits_target {
                    st.state = Idiom2State::E0WatchX;
                    self.i2_reset(st, acts);
                }
            }
            Idiom2State::E0E1 => {
                if hits_target && st.events[0].thd != Some(thd) {
                    st.state = Idiom2State::E0E1Watch;
                }
            }
            Idiom2State::E0E1Watch => {
                if hits_target {
                    st.state = Idiom2State::E0E1WatchX;
                    self.i2_reset(st, acts);
                }
            }
            Idiom2State::E1 => {
                if hits_target && Some(thd) != st.events[1].thd {
                    st.state = Idiom2State::E1Watch;
                }
            }
            Idiom2State::E1Watch => {
                if hits_target {
                    st.state = Idiom2State::E1WatchX;
                    self.i2_reset(st, acts);
                }
            }
            _ => {}
        }
    }

    fn i2_tick(&self, st: &mut Idiom2Status, thd: ThreadId, n: u64, acts: &mut Vec<Act>) {
        let holder = match st.state {
            Idiom2State::E0 | Idiom2State::E0Watch => st.events[0].thd,
            Idiom2State::E1 | Idiom2State::E1Watch => st.events[1].thd,
            Idiom2State::E0E1 | Idiom2State::E0E1Watch => st.events[0].thd,
            _ => return,
        };
        if Some(thd) == holder {
            return;
        }
        if consume_window(&mut st.window, n) {
            self.i2_reset(st, acts);
        }
    }

    // -----------------------------------------------------------------------
    // Idioms 3 and 4 (nested pairs; 4 additionally spans two locations)
    // -----------------------------------------------------------------------

    fn i3_reset(&self, st: &mut Idiom3Status, acts: &mut Vec<Act>) {
        debug!("idiom3: {} -> Init", st.state);
        st.state = Idiom3State::Init;
        st.events.iter_mut().for_each(|e| e.clear());
        st.delay_set.clear();
        st.window = 0;
        self.wake_all(acts);
        self.spend_attempt();
    }

    fn i3_before(
        &self,
        st: &mut Idiom3Status,
        thd: ThreadId,
        idx: usize,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) -> bool {
        match (st.state, idx) {
            (Idiom3State::Init, 0) => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom3State::Init, 1) => {
                st.events[1].bind(thd, addr, size);
                st.state = Idiom3State::E1;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom3State::E1, 0) if Some(thd) != st.events[1].thd => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom3State::E1, 3) if st.events[1].thd != Some(thd) => {
                // The opening thread ran all the way to its closing event
                // while the remote one was held.
                st.state = Idiom3State::E1WatchE3;
                st.state = Idiom3State::E1WatchE3X;
                self.i3_reset(st, acts);
                false
            }
            (Idiom3State::E0, 1)
                if Some(thd) != st.events[0].thd && st.events[0].overlaps(addr, size) =>
            {
                st.events[1].bind(thd, addr, size);
                true
            }
            (Idiom3State::E0, 3) if st.events[0].thd == Some(thd) => {
                st.state = Idiom3State::E0WatchE3;
                self.i3_reset(st, acts);
                false
            }
            (Idiom3State::E0E1, 2)
                if st.events[1].thd == Some(thd) && st.events[0].overlaps(addr, size) =>
            {
                st.events[2].bind(thd, addr, size);
                true
            }
            (Idiom3State::E1WatchE2, 3)
                if st.events[0].thd == Some(thd) && st.events[0].overlaps(addr, size) =>
            {
                st.events[3].bind(thd, addr, size);
                true
            }
            _ => false,
        }
    }

    fn i3_after(&self, st: &mut Idiom3Status, thd: ThreadId, idx: usize, acts: &mut Vec<Act>) {
        match (st.state, idx) {
            (Idiom3State::Init, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom3: Init -> E0");
                st.state = Idiom3State::E0;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom3State::E1, 0) if st.events[0].thd == Some(thd) => {
                if st.events[1].overlaps(st.events[0].addr, st.events[0].size) {
                    debug!("idiom3: E1 -> E0E1");
                    st.state = Idiom3State::E0E1;
                    st.window = self.vw;
                    st.delay_set.clear();
                    self.wake_all(acts);
                    st.delay_set.insert(thd);
                    acts.push(Act::Prio(thd, self.bands.lower));
                    acts.push(Act::ParkSelf);
                } else {
                    st.events[0].clear();
                }
            }
            (Idiom3State::E0, 1) if st.events[1].thd == Some(thd) => {
                debug!("idiom3: E0 -> E0E1");
                st.state = Idiom3State::E0E1;
                st.window = self.vw;
            }
            (Idiom3State::E0E1, 2) if st.events[2].thd == Some(thd) => {
                debug!("idiom3: E0E1 -> E1WatchE2");
                st.state = Idiom3State::E1WatchE2;
                st.window = self.vw;
                // The inner pair is half done; the opening thread must
                // close it now, ahead of the remote thread.
                st.delay_set.clear();
                self.wake_all(acts);
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                acts.push(Act::ParkSelf);
            }
            (Idiom3State::E1WatchE2, 3) if st.events[3].thd == Some(thd) => {
                debug!("idiom3: E1WatchE2 -> E0E1E2E3 -> Done");
                st.state = Idiom3State::E0E1E2E3;
                st.state = Idiom3State::Done;
                self.mark_success(acts);
            }
            _ => {}
        }
    }

    fn i3_watch(
        &self,
        st: &mut Idiom3Status,
        thd: ThreadId,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) {
        let hits_target = st.events[0].overlaps(addr, size);
        match st.state {
            Idiom3State::E0 => {
                if hits_target && Some(thd) != st.events[0].thd {
                    st.state = Idiom3State::E0Watch;
                }
            }
            Idiom3State::E0Watch => {
                if hits_target {
                    st.state = Idiom3State::E0WatchX;
                    self.i3_reset(st, acts);
                }
            }
            Idiom3State::E1 => {
                if hits_target && Some(thd) != st.events[1].thd {
                    st.state = Idiom3State::E1Watch;
                }
            }
            Idiom3State::E1Watch => {
                if hits_target {
                    st.state = Idiom3State::E1WatchX;
                    self.i3_reset(st, acts);
                }
            }
            Idiom3State::E0E1 => {
                if hits_target && st.events[1].thd != Some(thd) {
                    st.state = Idiom3State::E0E1Watch;
                }
            }
            Idiom3State::E0E1Watch => {
                if hits_target {
                    self.i3_reset(st, acts);
                }
            }
            Idiom3State::E1WatchE2 => {
                if hits_target && st.events[0].thd != Some(thd) {
                    st.state = Idiom3State::E1WatchE2Watch;
                }
            }
            Idiom3State::E1WatchE2Watch => {
                if hits_target {
                    st.state = Idiom3State::E1WatchE2WatchX;
                    self.i3_reset(st, acts);
                }
            }
            _ => {}
        }
    }

    fn i3_tick(&self, st: &mut Idiom3Status, thd: ThreadId, n: u64, acts: &mut Vec<Act>) {
        let holder = match st.state {
            Idiom3State::E0 | Idiom3State::E0Watch | Idiom3State::E0E1
            | Idiom3State::E0E1Watch => st.events[0].thd,
            Idiom3State::E1 | Idiom3State::E1Watch => st.events[1].thd,
            Idiom3State::E1WatchE2 | Idiom3State::E1WatchE2Watch => st.events[0].thd,
            _ => return,
        };
        if Some(thd) == holder {
            return;
        }
        if consume_window(&mut st.window, n) {
            self.i3_reset(st, acts);
        }
    }

    fn i4_reset(&self, st: &mut Idiom4Status, acts: &mut Vec<Act>) {
        debug!("idiom4: {} -> Init", st.state);
        st.state = Idiom4State::Init;
        st.events.iter_mut().for_each(|e| e.clear());
        st.delay_set.clear();
        st.recorded_addrs.clear();
        st.window = 0;
        self.wake_all(acts);
        self.spend_attempt();
    }

    fn i4_before(
        &self,
        st: &mut Idiom4Status,
        thd: ThreadId,
        idx: usize,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) -> bool {
        match (st.state, idx) {
            (Idiom4State::Init, 0) => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom4State::Init, 1) => {
                st.events[1].bind(thd, addr, size);
                st.state = Idiom4State::E1;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom4State::E1, 0) if Some(thd) != st.events[1].thd => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom4State::E1, 3) if st.events[1].thd != Some(thd) => {
                st.state = Idiom4State::E1WatchE3;
                st.state = Idiom4State::E1WatchE3X;
                self.i4_reset(st, acts);
                false
            }
            (Idiom4State::E0, 1)
                if Some(thd) != st.events[0].thd && st.events[0].overlaps(addr, size) =>
            {
                st.events[1].bind(thd, addr, size);
                true
            }
            (Idiom4State::E0, 3) if st.events[0].thd == Some(thd) => {
                st.state = Idiom4State::E0WatchE3;
                self.i4_reset(st, acts);
                false
            }
            (Idiom4State::E0E1, 2)
                if st.events[1].thd == Some(thd) && !st.events[0].overlaps(addr, size) =>
            {
                // The inner pair lives on a second location.
                st.events[2].bind(thd, addr, size);
                true
            }
            (Idiom4State::E1WatchE2, 3)
                if st.events[0].thd == Some(thd) && st.events[2].overlaps(addr, size) =>
            {
                st.events[3].bind(thd, addr, size);
                true
            }
            _ => false,
        }
    }

    fn i4_after(&self, st: &mut Idiom4Status, thd: ThreadId, idx: usize, acts: &mut Vec<Act>) {
        match (st.state, idx) {
            (Idiom4State::Init, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom4: Init -> E0");
                st.state = Idiom4State::E0;
                st.window = self.vw;
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom4State::E1, 0) if st.events[0].thd == Some(thd) => {
                if st.events[1].overlaps(st.events[0].addr, st.events[0].size) {
                    debug!("idiom4: E1 -> E0E1");
                    st.state = Idiom4State::E0E1;
                    st.window = self.vw;
                    st.delay_set.clear();
                    self.wake_all(acts);
                    st.delay_set.insert(thd);
                    acts.push(Act::Prio(thd, self.bands.lower));
                    acts.push(Act::ParkSelf);
                } else {
                    st.events[0].clear();
                }
            }
            (Idiom4State::E0, 1) if st.events[1].thd == Some(thd) => {
                debug!("idiom4: E0 -> E0E1");
                st.state = Idiom4State::E0E1;
                st.window = self.vw;
            }
            (Idiom4State::E0E1, 2) if st.events[2].thd == Some(thd) => {
                debug!("idiom4: E0E1 -> E1WatchE2");
                st.state = Idiom4State::E1WatchE2;
                st.window = self.vw;
                st.recorded_addrs.clear();
                st.delay_set.clear();
                self.wake_all(acts);
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                acts.push(Act::ParkSelf);
            }
            (Idiom4State::E1WatchE2, 3) if st.events[3].thd == Some(thd) => {
                debug!("idiom4: E1WatchE2 -> E0E1E2E3 -> Done");
                st.state = Idiom4State::E0E1E2E3;
                st.state = Idiom4State::Done;
                self.mark_success(acts);
            }
            _ => {}
        }
    }

    fn i4_watch(
        &self,
        st: &mut Idiom4Status,
        thd: ThreadId,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) {
        let hits_outer = st.events[0].overlaps(addr, size);
        let hits_inner = st.events[2].overlaps(addr, size);
        match st.state {
            Idiom4State::E0 => {
                if hits_outer && Some(thd) != st.events[0].thd {
                    st.state = Idiom4State::E0Watch;
                }
            }
            Idiom4State::E0Watch => {
                if hits_outer {
                    st.state = Idiom4State::E0WatchX;
                    self.i4_reset(st, acts);
                }
            }
            Idiom4State::E1 => {
                if hits_outer && Some(thd) != st.events[1].thd {
                    st.state = Idiom4State::E1Watch;
                }
            }
            Idiom4State::E1Watch => {
                if hits_outer {
                    st.state = Idiom4State::E1WatchX;
                    self.i4_reset(st, acts);
                }
            }
            Idiom4State::E0E1 => {
                if hits_outer && st.events[1].thd != Some(thd) {
                    st.state = Idiom4State::E0E1Watch;
                }
            }
            Idiom4State::E0E1Watch => {
                if hits_outer {
                    self.i4_reset(st, acts);
                }
            }
            Idiom4State::E1WatchE2 => {
                // Accesses between the inner events may invalidate either
                // location binding; repeats of a recorded address do.
                if (hits_outer || hits_inner) && st.events[0].thd != Some(thd) {
                    st.state = Idiom4State::E1WatchE2Watch;
                } else if !st.recorded_addrs.insert(addr) {
                    st.state = Idiom4State::E1WatchE2Watch;
                }
            }
            Idiom4State::E1WatchE2Watch => {
                if hits_outer || hits_inner {
                    st.state = Idiom4State::E1WatchE2WatchX;
                    self.i4_reset(st, acts);
                }
            }
            _ => {}
        }
    }

    fn i4_tick(&self, st: &mut Idiom4Status, thd: ThreadId, n: u64, acts: &mut Vec<Act>) {
        let holder = match st.state {
            Idiom4State::E0 | Idiom4State::E0Watch | Idiom4State::E0E1
            | Idiom4State::E0E1Watch => st.events[0].thd,
            Idiom4State::E1 | Idiom4State::E1Watch => st.events[1].thd,
            Idiom4State::E1WatchE2 | Idiom4State::E1WatchE2Watch => st.events[0].thd,
            _ => return,
        };
        if Some(thd) == holder {
            return;
        }
        if consume_window(&mut st.window, n) {
            self.i4_reset(st, acts);
        }
    }

    // -----------------------------------------------------------------------
    // Idiom 5 (reversed timing / deadlock shape)
    // -----------------------------------------------------------------------

    fn i5_reset(&self, st: &mut Idiom5Status, acts: &mut Vec<Act>) {
        debug!("idiom5: {} -> Init", st.state);
        st.state = Idiom5State::Init;
        st.events.iter_mut().for_each(|e| e.clear());
        st.delay_set.clear();
        st.recorded_addrs0.clear();
        st.recorded_addrs2.clear();
        st.windows = [0; 2];
        self.wake_all(acts);
        self.spend_attempt();
    }

    fn i5_before(
        &self,
        st: &mut Idiom5Status,
        thd: ThreadId,
        idx: usize,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) -> bool {
        match (st.state, idx) {
            (Idiom5State::Init, 0) => {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom5State::Init, 2) => {
                st.events[2].bind(thd, addr, size);
                true
            }
            (Idiom5State::E0, 2)
                if Some(thd) != st.events[0].thd && !st.events[0].overlaps(addr, size) =>
            {
                st.events[2].bind(thd, addr, size);
                true
            }
            (Idiom5State::E2, 0)
                if Some(thd) != st.events[2].thd && !st.events[2].overlaps(addr, size) =>
            {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom5State::E0, 3) if st.events[0].thd == Some(thd) => {
                // The opening thread is already heading into its blocking
                // event; hold it there until the other side opens.
                debug!("idiom5: E0 -> E0WatchE3");
                st.state = Idiom5State::E0WatchE3;
                st.events[3].bind(thd, addr, size);
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom5State::E2, 1) if st.events[2].thd == Some(thd) => {
                debug!("idiom5: E2 -> E2WatchE1");
                st.state = Idiom5State::E2WatchE1;
                st.events[1].bind(thd, addr, size);
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.min));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
                true
            }
            (Idiom5State::E0WatchE3, 2)
                if Some(thd) != st.events[0].thd && !st.events[0].overlaps(addr, size) =>
            {
                st.events[2].bind(thd, addr, size);
                true
            }
            (Idiom5State::E2WatchE1, 0)
                if Some(thd) != st.events[2].thd && !st.events[2].overlaps(addr, size) =>
            {
                st.events[0].bind(thd, addr, size);
                true
            }
            (Idiom5State::E0E2, 3)
                if st.events[0].thd == Some(thd) && st.events[2].overlaps(addr, size) =>
            {
                debug!("idiom5: E0E2 -> E0E2WatchE3");
                st.state = Idiom5State::E0E2WatchE3;
                st.events[3].bind(thd, addr, size);
                true
            }
            (Idiom5State::E0E2, 1)
                if st.events[2].thd == Some(thd) && st.events[0].overlaps(addr, size) =>
            {
                debug!("idiom5: E0E2 -> E0E2WatchE1");
                st.state = Idiom5State::E0E2WatchE1;
                st.events[1].bind(thd, addr, size);
                true
            }
            (Idiom5State::E0E2WatchE3, 1)
                if st.events[2].thd == Some(thd) && st.events[0].overlaps(addr, size) =>
            {
                debug!("idiom5: E0E2WatchE3 -> E0E1E2E3 -> Done");
                st.events[1].bind(thd, addr, size);
                st.state = Idiom5State::E0E1E2E3;
                st.state = Idiom5State::Done;
                self.mark_success(acts);
                true
            }
            (Idiom5State::E0E2WatchE1, 3)
                if st.events[0].thd == Some(thd) && st.events[2].overlaps(addr, size) =>
            {
                debug!("idiom5: E0E2WatchE1 -> E0E1E2E3 -> Done");
                st.events[3].bind(thd, addr, size);
                st.state = Idiom5State::E0E1E2E3;
                st.state = Idiom5State::Done;
                self.mark_success(acts);
                true
            }
            (Idiom5State::E0E2WatchE3WatchX, 1)
                if st.events[2].thd == Some(thd) && st.events[0].overlaps(addr, size) =>
            {
                // The expired watch can still complete if the closing
                // event arrives at exactly this point.
                debug!("idiom5: E0E2WatchE3WatchX -> Done");
                st.events[1].bind(thd, addr, size);
                st.state = Idiom5State::Done;
                self.mark_success(acts);
                true
            }
            (Idiom5State::E0E2WatchE1WatchX, 3)
                if st.events[0].thd == Some(thd) && st.events[2].overlaps(addr, size) =>
            {
                debug!("idiom5: E0E2WatchE1WatchX -> Done");
                st.events[3].bind(thd, addr, size);
                st.state = Idiom5State::Done;
                self.mark_success(acts);
                true
            }
            _ => false,
        }
    }

    fn i5_after(&self, st: &mut Idiom5Status, thd: ThreadId, idx: usize, acts: &mut Vec<Act>) {
        match (st.state, idx) {
            (Idiom5State::Init, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom5: Init -> E0");
                st.state = Idiom5State::E0;
                st.windows[0] = self.vw;
                st.recorded_addrs0.clear();
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom5State::Init, 2) if st.events[2].thd == Some(thd) => {
                debug!("idiom5: Init -> E2");
                st.state = Idiom5State::E2;
                st.windows[1] = self.vw;
                st.recorded_addrs2.clear();
                st.delay_set.insert(thd);
                acts.push(Act::Prio(thd, self.bands.lower));
                self.promote_others(thd, acts);
                acts.push(Act::ParkSelf);
            }
            (Idiom5State::E0, 2) if st.events[2].thd == Some(thd) => {
                debug!("idiom5: E0 -> E0E2");
                st.state = Idiom5State::E0E2;
                st.windows = [self.vw, self.vw];
                st.delay_set.clear();
                self.wake_all(acts);
            }
            (Idiom5State::E2, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom5: E2 -> E0E2");
                st.state = Idiom5State::E0E2;
                st.windows = [self.vw, self.vw];
                st.delay_set.clear();
                self.wake_all(acts);
            }
            (Idiom5State::E0WatchE3, 2) if st.events[2].thd == Some(thd) => {
                debug!("idiom5: E0WatchE3 -> E0E2WatchE3");
                st.state = Idiom5State::E0E2WatchE3;
                st.windows[1] = self.vw;
                // Release the thread parked at its closing event.
                st.delay_set.clear();
                self.wake_all(acts);
            }
            (Idiom5State::E2WatchE1, 0) if st.events[0].thd == Some(thd) => {
                debug!("idiom5: E2WatchE1 -> E0E2WatchE1");
                st.state = Idiom5State::E0E2WatchE1;
                st.windows[0] = self.vw;
                st.delay_set.clear();
                self.wake_all(acts);
            }
            // For plain (non-blocking) idiom-5 targets the machine is
            // already Done when the closing events complete.
            _ => {}
        }
    }

    fn i5_watch(
        &self,
        st: &mut Idiom5Status,
        thd: ThreadId,
        addr: Address,
        size: usize,
        acts: &mut Vec<Act>,
    ) {
        let hits0 = st.events[0].overlaps(addr, size);
        let hits2 = st.events[2].overlaps(addr, size);
        match st.state {
            Idiom5State::E0 => {
                if hits0 && Some(thd) != st.events[0].thd {
                    st.recorded_addrs0.insert(addr);
                    st.state = Idiom5State::E0Watch;
                }
            }
            Idiom5State::E0Watch => {
                if hits0 {
                    st.state = Idiom5State::E0WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E2 => {
                if hits2 && Some(thd) != st.events[2].thd {
                    st.recorded_addrs2.insert(addr);
                    st.state = Idiom5State::E2Watch;
                }
            }
            Idiom5State::E2Watch => {
                if hits2 {
                    st.state = Idiom5State::E2WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E0E2 => {
                if (hits0 || hits2)
                    && Some(thd) != st.events[0].thd
                    && Some(thd) != st.events[2].thd
                {
                    st.state = Idiom5State::E0E2Watch;
                }
            }
            Idiom5State::E0E2Watch => {
                if hits0 || hits2 {
                    st.state = Idiom5State::E0E2WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E0E2WatchE3 => {
                if hits2 && Some(thd) != st.events[0].thd {
                    st.state = Idiom5State::E0E2WatchE3Watch;
                }
            }
            Idiom5State::E0E2WatchE3Watch => {
                if hits2 {
                    st.state = Idiom5State::E0E2WatchE3X;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E0E2WatchE1 => {
                if hits0 && Some(thd) != st.events[2].thd {
                    st.state = Idiom5State::E0E2WatchE1Watch;
                }
            }
            Idiom5State::E0E2WatchE1Watch => {
                if hits0 {
                    st.state = Idiom5State::E0E2WatchE1X;
                    self.i5_reset(st, acts);
                }
            }
            _ => {}
        }
    }

    fn i5_tick(&self, st: &mut Idiom5Status, thd: ThreadId, n: u64, acts: &mut Vec<Act>) {
        match st.state {
            Idiom5State::E0 | Idiom5State::E0Watch => {
                if Some(thd) != st.events[0].thd && consume_window(&mut st.windows[0], n) {
                    st.state = Idiom5State::E0WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E2 | Idiom5State::E2Watch => {
                if Some(thd) != st.events[2].thd && consume_window(&mut st.windows[1], n) {
                    st.state = Idiom5State::E2WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E0E2 | Idiom5State::E0E2Watch => {
                if consume_window(&mut st.windows[0], n) {
                    st.state = Idiom5State::E0E2WatchX;
                    self.i5_reset(st, acts);
                }
            }
            Idiom5State::E0E2WatchE3 | Idiom5State::E0E2WatchE3Watch => {
                if Some(thd) != st.events[0].thd && consume_window(&mut st.windows[1], n) {
                    // Hold in the expired state one beat: the closing
                    // event may still land here.
                    st.state = Idiom5State::E0E2WatchE3WatchX;
                }
            }
            Idiom5State::E0E2WatchE1 | Idiom5State::E0E2WatchE1Watch => {
                if Some(thd) != st.events[2].thd && consume_window(&mut st.windows[0], n) {
                    st.state = Idiom5State::E0E2WatchE1WatchX;
                }
            }
            Idiom5State::E0E2WatchE3WatchX | Idiom5State::E0E2WatchE1WatchX => {
                self.i5_reset(st, acts);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn handle_before(
        &self,
        thd: ThreadId,
        inst: &Arc<Inst>,
        kind: EventKind,
        addr: Address,
        size: usize,
    ) {
        if !self.is_active() {
            return;
        }
        let indices = self.target_indices(inst, kind);
        let mut acts = Vec::new();
        let mut consumed = None;
        {
            let mut machine = self.machine.lock().unwrap();
            if indices.is_empty() {
                match &mut *machine {
                    Machine::I1(st) => self.i1_watch(st, thd, addr, size, &mut acts),
                    Machine::I2(st) => self.i2_watch(st, thd, addr, size, &mut acts),
                    Machine::I3(st) => self.i3_watch(st, thd, addr, size, &mut acts),
                    Machine::I4(st) => self.i4_watch(st, thd, addr, size, &mut acts),
                    Machine::I5(st) => self.i5_watch(st, thd, addr, size, &mut acts),
                }
            } else {
                for &idx in &indices {
                    let taken = match &mut *machine {
                        Machine::I1(st) => self.i1_before(st, thd, idx, addr, size, &mut acts),
                        Machine::I2(st) => self.i2_before(st, thd, idx, addr, size, &mut acts),
                        Machine::I3(st) => self.i3_before(st, thd, idx, addr, size, &mut acts),
                        Machine::I4(st) => self.i4_before(st, thd, idx, addr, size, &mut acts),
                        Machine::I5(st) => self.i5_before(st, thd, idx, addr, size, &mut acts),
                    };
                    if taken {
                        consumed = Some(idx);
                        break;
                    }
                }
            }
        }
        if let Some(idx) = consumed {
            self.misc.lock().unwrap().pending.insert(thd, idx);
        }
        self.apply(thd, acts);
    }

    fn handle_after(&self, thd: ThreadId) {
        let Some(idx) = self.misc.lock().unwrap().pending.remove(&thd) else {
            return;
        };
        if !self.is_active() {
            return;
        }
        let mut acts = Vec::new();
        {
            let mut machine = self.machine.lock().unwrap();
            match &mut *machine {
                Machine::I1(st) => self.i1_after(st, thd, idx, &mut acts),
                Machine::I2(st) => self.i2_after(st, thd, idx, &mut acts),
                Machine::I3(st) => self.i3_after(st, thd, idx, &mut acts),
                Machine::I4(st) => self.i4_after(st, thd, idx, &mut acts),
                Machine::I5(st) => self.i5_after(st, thd, idx, &mut acts),
            }
        }
        self.apply(thd, acts);
    }
}

impl Steering for ActiveScheduler {
    fn thread_start(&self, thd: ThreadId, _parent: Option<ThreadId>) {
        let priority = {
            let mut misc = self.misc.lock().unwrap();
            misc.alive.insert(thd);
            let priority = if misc.alive.len() == 1 {
                self.bands.normal
            } else {
                let p = misc.pool[misc.pool_cursor % misc.pool.len()];
                misc.pool_cursor += 1;
                p
            };
            misc.priorities.insert(thd, priority);
            if misc.alive.len() >= 2 {
                self.started.store(true, Ordering::SeqCst);
            }
            priority
        };
        self.control.register_thread(thd, priority);
    }

    fn thread_exit(&self, thd: ThreadId) {
        {
            let mut misc = self.misc.lock().unwrap();
            misc.alive.remove(&thd);
            misc.pending.remove(&thd);
        }
        // A bound thread leaving mid-attempt invalidates the attempt.
        let mut acts = Vec::new();
        {
            let mut machine = self.machine.lock().unwrap();
            let bound = match &*machine {
                Machine::I1(st) => st.events.iter().any(|e| e.thd == Some(thd)),
                Machine::I2(st) => st.events.iter().any(|e| e.thd == Some(thd)),
                Machine::I3(st) => st.events.iter().any(|e| e.thd == Some(thd)),
                Machine::I4(st) => st.events.iter().any(|e| e.thd == Some(thd)),
                Machine::I5(st) => st.events.iter().any(|e| e.thd == Some(thd)),
            };
            if bound && !self.exposed() {
                match &mut *machine {
                    Machine::I1(st) => self.i1_reset(st, &mut acts),
                    Machine::I2(st) => self.i2_reset(st, &mut acts),
                    Machine::I3(st) => self.i3_reset(st, &mut acts),
                    Machine::I4(st) => self.i4_reset(st, &mut acts),
                    Machine::I5(st) => self.i5_reset(st, &mut acts),
                }
            }
        }
        self.apply(thd, acts);
        self.control.thread_exit(thd);
    }

    fn before_mem(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address, size: usize, is_write: bool) {
        let kind = if is_write { EventKind::MemWrite } else { EventKind::MemRead };
        self.handle_before(thd, inst, kind, addr, size);
    }

    fn after_mem(&self, thd: ThreadId) {
        self.handle_after(thd);
    }

    fn before_mutex_lock(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address) {
        // Priority-inversion avoidance: if the owner of this lock is
        // demoted, boost it for the rest of its critical section.
        {
            let mut misc = self.misc.lock().unwrap();
            if let Some(&owner) = misc.lock_owner.get(&addr) {
                let owner_prio = misc.priorities.get(&owner).copied().unwrap_or(self.bands.normal);
                if owner_prio < self.bands.normal && !misc.boosted.contains_key(&owner) {
                    misc.boosted.insert(owner, owner_prio);
                    misc.priorities.insert(owner, self.bands.max);
                    self.control.set_priority(owner, self.bands.max);
                }
            }
        }
        self.control.set_blocked(thd, true);
        self.handle_before(thd, inst, EventKind::MutexLock, addr, 1);
    }

    fn after_mutex_lock(&self, thd: ThreadId, _inst: &Arc<Inst>, addr: Address) {
        self.control.set_blocked(thd, false);
        self.misc.lock().unwrap().lock_owner.insert(addr, thd);
        self.handle_after(thd);
    }

    fn before_mutex_unlock(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address) {
        self.handle_before(thd, inst, EventKind::MutexUnlock, addr, 1);
    }

    fn after_mutex_unlock(&self, thd: ThreadId, addr: Address) {
        let restore = {
            let mut misc = self.misc.lock().unwrap();
            misc.lock_owner.remove(&addr);
            let prev = misc.boosted.remove(&thd);
            if let Some(p) = prev {
                misc.priorities.insert(thd, p);
            }
            prev
        };
        if let Some(priority) = restore {
            self.control.set_priority(thd, priority);
        }
        self.handle_after(thd);
    }

    fn before_block(&self, thd: ThreadId) {
        self.control.set_blocked(thd, true);
    }

    fn after_block(&self, thd: ThreadId) {
        self.control.set_blocked(thd, false);
    }

    fn inst_count(&self, thd: ThreadId, count: u64) {
        if !self.is_active() {
            return;
        }
        let mut acts = Vec::new();
        {
            let mut machine = self.machine.lock().unwrap();
            match &mut *machine {
                Machine::I1(st) => self.i1_tick(st, thd, count, &mut acts),
                Machine::I2(st) => self.i2_tick(st, thd, count, &mut acts),
                Machine::I3(st) => self.i3_tick(st, thd, count, &mut acts),
                Machine::I4(st) => self.i4_tick(st, thd, count, &mut acts),
                Machine::I5(st) => self.i5_tick(st, thd, count, &mut acts),
            }
        }
        self.apply(thd, acts);
    }

    fn yield_point(&self, thd: ThreadId) {
        self.control.yield_point(thd);
    }

    fn program_exit(&self) {
        self.conclude();
    }
}
