//! Execution controller: the glue between a program under test and the
//! analysis stack.
//!
//! The controller owns the shared databases, the registered analyzers and
//! an optional steering policy (a scheduler). Application threads talk to
//! it through per-thread [`Probe`] handles:
//!
//! 1. steering gets its *before* hook (it may reprioritize threads),
//! 2. the event is delivered to every analyzer in a total order under the
//!    controller's analysis lock,
//! 3. the application operation runs,
//! 4. steering gets its *after* hook and a yield point where a demoted
//!    thread is actually descheduled.
//!
//! Analyzer callbacks never block. Steering hooks run outside the
//! analysis lock and may park the calling thread.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::event::{Address, Analyzer, AtomicOp, Event, ThreadId, Timestamp};
use crate::iroot::IrootDb;
use crate::memo::Memo;
use crate::observer::Observer;
use crate::options::Options;
use crate::predict::Predictor;
use crate::registry::{Inst, StaticRegistry};
use crate::sinst::SharedInstDb;

/// A scheduling policy steering the program under test.
///
/// Hooks run inline in application threads, outside the analysis lock,
/// and may park the caller to hold it back.
#[allow(unused_variables)]
pub trait Steering: Send + Sync {
    fn thread_start(&self, thd: ThreadId, parent: Option<ThreadId>) {}
    fn thread_exit(&self, thd: ThreadId) {}
    fn before_mem(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address, size: usize, is_write: bool) {}
    fn after_mem(&self, thd: ThreadId) {}
    fn before_mutex_lock(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address) {}
    fn after_mutex_lock(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address) {}
    fn before_mutex_unlock(&self, thd: ThreadId, inst: &Arc<Inst>, addr: Address) {}
    fn after_mutex_unlock(&self, thd: ThreadId, addr: Address) {}
    fn inst_count(&self, thd: ThreadId, count: u64) {}
    /// The thread is about to block in a join, cond wait or barrier; it
    /// must not count as runnable until `after_block`.
    fn before_block(&self, thd: ThreadId) {}
    fn after_block(&self, thd: ThreadId) {}
    /// Cooperative descheduling point; may park the calling thread.
    fn yield_point(&self, thd: ThreadId) {}
    fn program_exit(&self) {}
}

/// The central controller for one run of the program under test.
pub struct Controller {
    registry: Arc<StaticRegistry>,
    iroot_db: Arc<IrootDb>,
    memo: Arc<Memo>,
    sinst_db: Arc<SharedInstDb>,
    analyzers: Mutex<Vec<Box<dyn Analyzer>>>,
    steering: Mutex<Option<Arc<dyn Steering>>>,
    next_thd: AtomicU32,
    opts: Options,
}

impl Controller {
    /// A controller with no analyzers; attach them with `add_analyzer`.
    pub fn new(opts: &Options) -> Self {
        let registry = Arc::new(StaticRegistry::new());
        let iroot_db = Arc::new(IrootDb::new());
        let memo = Arc::new(Memo::new(Arc::clone(&iroot_db)));
        let sinst_db = Arc::new(SharedInstDb::new());
        Self {
            registry,
            iroot_db,
            memo,
            sinst_db,
            analyzers: Mutex::new(Vec::new()),
            steering: Mutex::new(None),
            next_thd: AtomicU32::new(0),
            opts: opts.clone(),
        }
    }

    /// A controller running the iRoot predictor.
    pub fn for_prediction(opts: &Options) -> Self {
        let ctrl = Self::new(opts);
        let predictor = Predictor::new(
            opts,
            Arc::clone(&ctrl.iroot_db),
            Arc::clone(&ctrl.memo),
            Arc::clone(&ctrl.sinst_db),
        );
        ctrl.add_analyzer(Box::new(predictor));
        ctrl
    }

    /// A controller running the passive observer.
    pub fn for_observation(opts: &Options) -> Self {
        let ctrl = Self::new(opts);
        let observer = Observer::new(opts, Arc::clone(&ctrl.iroot_db), Arc::clone(&ctrl.memo));
        ctrl.add_analyzer(Box::new(observer));
        ctrl
    }

    /// A controller running observer and predictor together, the usual
    /// profiling configuration.
    pub fn for_profile(opts: &Options) -> Self {
        let ctrl = Self::new(opts);
        let observer = Observer::new(opts, Arc::clone(&ctrl.iroot_db), Arc::clone(&ctrl.memo));
        let predictor = Predictor::new(
            opts,
            Arc::clone(&ctrl.iroot_db),
            Arc::clone(&ctrl.memo),
            Arc::clone(&ctrl.sinst_db),
        );
        ctrl.add_analyzer(Box::new(observer));
        ctrl.add_analyzer(Box::new(predictor));
        ctrl
    }

    pub fn add_analyzer(&self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.lock().unwrap().push(analyzer);
    }

    pub fn set_steering(&self, steering: Arc<dyn Steering>) {
        *self.steering.lock().unwrap() = Some(steering);
    }

    pub fn registry(&self) -> &Arc<StaticRegistry> {
        &self.registry
    }

    pub fn iroot_db(&self) -> &Arc<IrootDb> {
        &self.iroot_db
    }

    pub fn memo(&self) -> &Arc<Memo> {
        &self.memo
    }

    pub fn sinst_db(&self) -> &Arc<SharedInstDb> {
        &self.sinst_db
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Load whatever databases already exist in the configured directory.
    /// Missing files are a cold start, not an error.
    pub fn load_databases(&self) -> io::Result<()> {
        let opts = &self.opts;
        if opts.sinfo_db().exists() {
            self.registry.load(&opts.sinfo_db())?;
        }
        if opts.iroot_db().exists() {
            self.iroot_db.load(&opts.iroot_db(), &self.registry)?;
        }
        if opts.memo_db().exists() {
            self.memo.load(&opts.memo_db())?;
        }
        if opts.sinst_db().exists() {
            self.sinst_db.load(&opts.sinst_db())?;
        }
        Ok(())
    }

    /// Persist the databases, best-effort: a failed save is logged, not
    /// propagated.
    pub fn save_databases(&self) {
        let opts = &self.opts;
        for (name, result) in [
            ("sinfo", self.registry.save(&opts.sinfo_db())),
            ("iroot", self.iroot_db.save(&opts.iroot_db())),
            ("memo", self.memo.save(&opts.memo_db())),
            ("sinst", self.sinst_db.save(&opts.sinst_db())),
        ] {
            if let Err(e) = result {
                warn!("failed to save {name} database: {e}");
            }
        }
    }

    /// Register a new application thread. The returned id is what the
    /// child passes to [`Controller::probe`]; registering from the parent
    /// before the spawn keeps the parent/child clock seeding ordered.
    pub fn create_thread(self: &Arc<Self>, parent: Option<ThreadId>) -> ThreadId {
        let thd = self.next_thd.fetch_add(1, Ordering::Relaxed);
        self.dispatch(Event::ThreadStart { thd, parent });
        if let Some(steering) = self.steering() {
            steering.thread_start(thd, parent);
        }
        thd
    }

    /// The probe for a registered thread.
    pub fn probe(self: &Arc<Self>, thd: ThreadId) -> Probe {
        Probe { ctrl: Arc::clone(self), thd, clk: 0 }
    }

    /// Register and return the main thread's probe.
    pub fn main_thread(self: &Arc<Self>) -> Probe {
        let thd = self.create_thread(None);
        self.probe(thd)
    }

    /// Run end-of-program analysis and report counts.
    pub fn program_exit(&self) {
        {
            let mut analyzers = self.analyzers.lock().unwrap();
            for analyzer in analyzers.iter_mut() {
                analyzer.program_exit();
            }
        }
        if let Some(steering) = self.steering() {
            steering.program_exit();
        }
        info!(
            "run complete: {} iroots, {} candidates",
            self.iroot_db.iroot_count(),
            self.memo.total_candidates()
        );
    }

    fn steering(&self) -> Option<Arc<dyn Steering>> {
        self.steering.lock().unwrap().clone()
    }

    /// Deliver one event to every analyzer under the analysis lock.
    fn dispatch(&self, event: Event) {
        let mut analyzers = self.analyzers.lock().unwrap();
        for analyzer in analyzers.iter_mut() {
            analyzer.event(&event);
        }
    }
}

/// Per-thread handle through which the program under test reports its
/// actions. One probe per thread; the handle is `Send` but deliberately
/// not `Sync` or `Clone`.
pub struct Probe {
    ctrl: Arc<Controller>,
    thd: ThreadId,
    clk: Timestamp,
}

impl Probe {
    pub fn thread_id(&self) -> ThreadId {
        self.thd
    }

    pub fn clock(&self) -> Timestamp {
        self.clk
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.ctrl
    }

    fn tick(&mut self) -> Timestamp {
        self.clk += 1;
        self.clk
    }

    fn gate(&self) {
        if let Some(steering) = self.ctrl.steering() {
            steering.yield_point(self.thd);
        }
    }

    /// Report a memory read around the actual access.
    pub fn mem_read<R>(
        &mut self,
        inst: &Arc<Inst>,
        addr: Address,
        size: usize,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        if let Some(s) = self.ctrl.steering() {
            s.before_mem(self.thd, inst, addr, size, false);
        }
        self.ctrl.dispatch(Event::MemRead {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
            size,
        });
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_mem(self.thd);
        }
        self.gate();
        result
    }

    /// Report a memory write around the actual access.
    pub fn mem_write<R>(
        &mut self,
        inst: &Arc<Inst>,
        addr: Address,
        size: usize,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        if let Some(s) = self.ctrl.steering() {
            s.before_mem(self.thd, inst, addr, size, true);
        }
        self.ctrl.dispatch(Event::MemWrite {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
            size,
        });
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_mem(self.thd);
        }
        self.gate();
        result
    }

    /// Report an atomic read-modify-write around the actual operation.
    pub fn atomic<R>(
        &mut self,
        inst: &Arc<Inst>,
        op_kind: AtomicOp,
        addr: Address,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        self.ctrl.dispatch(Event::AtomicBefore {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            op: op_kind,
            addr,
        });
        let result = op();
        self.ctrl.dispatch(Event::AtomicAfter {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            op: op_kind,
            addr,
        });
        self.gate();
        result
    }

    /// Report a mutex acquisition; the event is delivered after the lock
    /// is actually held.
    pub fn mutex_lock<R>(
        &mut self,
        inst: &Arc<Inst>,
        addr: Address,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        if let Some(s) = self.ctrl.steering() {
            s.before_mutex_lock(self.thd, inst, addr);
        }
        let result = op();
        self.ctrl.dispatch(Event::MutexLock {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
        });
        if let Some(s) = self.ctrl.steering() {
            s.after_mutex_lock(self.thd, inst, addr);
        }
        self.gate();
        result
    }

    /// Report a mutex release; the event is delivered before the unlock
    /// actually happens.
    pub fn mutex_unlock<R>(
        &mut self,
        inst: &Arc<Inst>,
        addr: Address,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        if let Some(s) = self.ctrl.steering() {
            s.before_mutex_unlock(self.thd, inst, addr);
        }
        self.ctrl.dispatch(Event::MutexUnlock {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
        });
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_mutex_unlock(self.thd, addr);
        }
        self.gate();
        result
    }

    /// Report a cond wait (the op is the actual wait, mutex already held).
    pub fn cond_wait<R>(
        &mut self,
        inst: &Arc<Inst>,
        cond: Address,
        mutex: Address,
        timed: bool,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        self.ctrl.dispatch(Event::CondWaitBefore {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            cond,
            mutex,
            timed,
        });
        if let Some(s) = self.ctrl.steering() {
            s.before_block(self.thd);
        }
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_block(self.thd);
        }
        let clk = self.tick();
        self.ctrl.dispatch(Event::CondWaitAfter {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            cond,
            mutex,
            timed,
        });
        self.gate();
        result
    }

    pub fn cond_signal<R>(&mut self, inst: &Arc<Inst>, cond: Address, op: impl FnOnce() -> R) -> R {
        let clk = self.tick();
        self.ctrl.dispatch(Event::CondSignal {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr: cond,
        });
        let result = op();
        self.gate();
        result
    }

    pub fn cond_broadcast<R>(
        &mut self,
        inst: &Arc<Inst>,
        cond: Address,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        self.ctrl.dispatch(Event::CondBroadcast {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr: cond,
        });
        let result = op();
        self.gate();
        result
    }

    pub fn barrier_wait<R>(
        &mut self,
        inst: &Arc<Inst>,
        addr: Address,
        op: impl FnOnce() -> R,
    ) -> R {
        let clk = self.tick();
        self.ctrl.dispatch(Event::BarrierWaitBefore {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
        });
        if let Some(s) = self.ctrl.steering() {
            s.before_block(self.thd);
        }
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_block(self.thd);
        }
        let clk = self.tick();
        self.ctrl.dispatch(Event::BarrierWaitAfter {
            thd: self.thd,
            clk,
            inst: Arc::clone(inst),
            addr,
        });
        self.gate();
        result
    }

    /// Report a join; the op performs the actual wait for the child.
    pub fn join<R>(&mut self, child: ThreadId, op: impl FnOnce() -> R) -> R {
        if let Some(s) = self.ctrl.steering() {
            s.before_block(self.thd);
        }
        let result = op();
        if let Some(s) = self.ctrl.steering() {
            s.after_block(self.thd);
        }
        let clk = self.tick();
        self.ctrl.dispatch(Event::Join { thd: self.thd, clk, child });
        result
    }

    pub fn region_alloc(&mut self, addr: Address, size: usize) {
        let clk = self.tick();
        self.ctrl.dispatch(Event::RegionAlloc { thd: self.thd, clk, addr, size });
    }

    pub fn region_free(&mut self, addr: Address) {
        let clk = self.tick();
        self.ctrl.dispatch(Event::RegionFree { thd: self.thd, clk, addr });
    }

    pub fn syscall_entry(&mut self, num: i64) {
        let clk = self.tick();
        self.ctrl.dispatch(Event::SyscallEntry { thd: self.thd, clk, num });
    }

    pub fn signal_received(&mut self, num: i32) {
        let clk = self.tick();
        self.ctrl.dispatch(Event::SignalReceived { thd: self.thd, clk, num });
    }

    /// Account `n` uninstrumented instructions (a basic block without
    /// monitored accesses) and give the scheduler a chance to act.
    pub fn inst_count(&mut self, n: u64) {
        self.clk += n;
        if let Some(s) = self.ctrl.steering() {
            s.inst_count(self.thd, n);
        }
        self.gate();
    }

    /// Report thread termination and release per-thread state.
    pub fn thread_exit(&mut self) {
        let clk = self.tick();
        self.ctrl.dispatch(Event::ThreadExit { thd: self.thd, clk });
        if let Some(s) = self.ctrl.steering() {
            s.thread_exit(self.thd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Collector {
        events: Arc<Mutex<Vec<String>>>,
        exited: Arc<AtomicUsize>,
    }

    impl Analyzer for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }
        fn event(&mut self, event: &Event) {
            let tag = match event {
                Event::ThreadStart { thd, .. } => format!("start:{thd}"),
                Event::MemRead { thd, clk, .. } => format!("read:{thd}@{clk}"),
                Event::MemWrite { thd, clk, .. } => format!("write:{thd}@{clk}"),
                Event::ThreadExit { thd, .. } => format!("exit:{thd}"),
                _ => "other".into(),
            };
            self.events.lock().unwrap().push(tag);
        }
        fn program_exit(&mut self) {
            self.exited.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct HookLog {
        hooks: Mutex<Vec<String>>,
    }

    impl Steering for HookLog {
        fn before_mem(&self, thd: ThreadId, _: &Arc<Inst>, _: Address, _: usize, is_write: bool) {
            let kind = if is_write { "w" } else { "r" };
            self.hooks.lock().unwrap().push(format!("before-{kind}:{thd}"));
        }
        fn after_mem(&self, thd: ThreadId) {
            self.hooks.lock().unwrap().push(format!("after:{thd}"));
        }
        fn yield_point(&self, thd: ThreadId) {
            self.hooks.lock().unwrap().push(format!("yield:{thd}"));
        }
    }

    #[test]
    fn events_are_delivered_in_probe_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let exited = Arc::new(AtomicUsize::new(0));
        let ctrl = Arc::new(Controller::new(&Options::default()));
        ctrl.add_analyzer(Box::new(Collector {
            events: Arc::clone(&events),
            exited: Arc::clone(&exited),
        }));

        let mut probe = ctrl.main_thread();
        let inst = ctrl.registry().pseudo_inst(0x10);
        probe.mem_read(&inst, 0x1000, 4, || ());
        probe.mem_write(&inst, 0x1000, 4, || ());
        probe.thread_exit();
        ctrl.program_exit();

        let log = events.lock().unwrap();
        assert_eq!(*log, vec!["start:0", "read:0@1", "write:0@2", "exit:0"]);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_ids_are_unique_and_ordered() {
        let ctrl = Arc::new(Controller::new(&Options::default()));
        let main = ctrl.create_thread(None);
        let a = ctrl.create_thread(Some(main));
        let b = ctrl.create_thread(Some(main));
        assert_eq!(main, 0);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn steering_hooks_bracket_the_operation() {
        let ctrl = Arc::new(Controller::new(&Options::default()));
        let steering = Arc::new(HookLog::default());
        ctrl.set_steering(Arc::clone(&steering) as Arc<dyn Steering>);

        let mut probe = ctrl.main_thread();
        let inst = ctrl.registry().pseudo_inst(0x10);
        probe.mem_write(&inst, 0x1000, 4, || ());
        let hooks = steering.hooks.lock().unwrap();
        assert_eq!(*hooks, vec!["before-w:0", "after:0", "yield:0"]);
    }

    #[test]
    fn probe_clock_advances_with_inst_count() {
        let ctrl = Arc::new(Controller::new(&Options::default()));
        let mut probe = ctrl.main_thread();
        let inst = ctrl.registry().pseudo_inst(0x10);
        probe.mem_read(&inst, 0x1000, 4, || ());
        assert_eq!(probe.clock(), 1);
        probe.inst_count(10);
        assert_eq!(probe.clock(), 11);
    }

    #[test]
    fn op_result_is_passed_through() {
        let ctrl = Arc::new(Controller::new(&Options::default()));
        let mut probe = ctrl.main_thread();
        let inst = ctrl.registry().pseudo_inst(0x10);
        let value = probe.mem_read(&inst, 0x1000, 4, || 42u64);
        assert_eq!(value, 42);
    }

    #[test]
    fn save_and_load_databases_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options { db_dir: dir.path().to_path_buf(), ..Options::default() };
        let ctrl = Arc::new(Controller::for_prediction(&opts));
        let mut probe = ctrl.main_thread();
        let img = ctrl.registry().intern_image("/usr/bin/app");
        let inst = ctrl.registry().intern_inst(&img, 0x40);
        probe.region_alloc(0x1000, 64);
        probe.mem_write(&inst, 0x1000, 4, || ());
        ctrl.program_exit();
        ctrl.save_databases();

        let ctrl2 = Arc::new(Controller::new(&opts));
        ctrl2.load_databases().unwrap();
        assert_eq!(ctrl2.registry().inst_count(), 1);
    }
}
