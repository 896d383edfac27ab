//! The iRoot predictor.
//!
//! From a single observed execution the predictor extrapolates which
//! inter-thread dependencies could fire under a different schedule. Per
//! monitored location it maintains an access history of canonical *access
//! summaries*: all dynamic accesses from one thread with the same static
//! context (instruction, kind, flagged lock set) merge into one summary
//! carrying an ordered list of `(vector clock, local clock range)` entries.
//!
//! Candidate idiom-1 dependencies are edges in a pair graph over access
//! summaries. An edge `src → dst` is recorded when the kinds conflict, the
//! flagged lock sets permit the two accesses to be scheduled back to back,
//! some vector-clock entry of the source is concurrent with the current
//! access, and no atomic read-modify-write constraint forbids the order.
//! When a location dies (free, region unload, program exit) a second pass
//! also links summaries that were ordered in this run but could reorder
//! under another schedule, advancing per-thread vector-clock frontiers.
//!
//! Compound idioms (2–5) are synthesized at program exit from per-thread
//! recent-access logs: a local pair within the vulnerability window plus a
//! remote thread holding a successor of the first and a predecessor of the
//! second.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};

use crate::clock::VectorClock;
use crate::event::{Address, Analyzer, AtomicOp, Event, ThreadId, Timestamp};
use crate::filter::RegionFilter;
use crate::iroot::{CountPair, EventKind, Idiom, Iroot, IrootDb};
use crate::lockset::{FlaggedLockSet, LockSet};
use crate::memo::Memo;
use crate::options::Options;
use crate::registry::{Inst, InstId};
use crate::sinst::SharedInstDb;

/// Syscalls whose entry opens an interruptible wait: accept, select,
/// pselect6, rt_sigtimedwait.
const ASYNC_SYSCALLS: &[i64] = &[43, 23, 270, 128];

/// Signals that mark asynchronous control flow: SIGINT, SIGALRM.
const ASYNC_SIGNALS: &[i32] = &[2, 14];

type MetaId = usize;
type AccSumId = usize;

/// Inclusive range of local clock values covered by one time-info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThdClkRange {
    start: Timestamp,
    end: Timestamp,
}

impl ThdClkRange {
    fn new(clk: Timestamp) -> Self {
        Self { start: clk, end: clk }
    }

    fn extend(&mut self, clk: Timestamp) {
        self.end = clk;
    }
}

/// Canonical merged representation of all accesses from one thread to one
/// location with identical static context.
#[derive(Debug)]
struct AccSum {
    meta: MetaId,
    thd: ThreadId,
    kind: EventKind,
    inst: Arc<Inst>,
    fls: FlaggedLockSet,
    tinfo: Vec<(VectorClock, ThdClkRange)>,
}

impl AccSum {
    fn last_range(&self) -> &ThdClkRange {
        &self.tinfo.last().expect("access summary has a time entry").1
    }
}

/// The most recent open access of one thread to one location.
#[derive(Debug, Clone)]
struct DynAcc {
    meta: MetaId,
    thd: ThreadId,
    thd_clk: Timestamp,
    kind: EventKind,
    inst: Arc<Inst>,
    vc: VectorClock,
    ls: LockSet,
    fls: FlaggedLockSet,
}

/// Access history of one location: summaries per thread, plus the open
/// dynamic access per thread.
#[derive(Debug, Default)]
struct AccHisto {
    acc_sums: BTreeMap<ThreadId, Vec<AccSumId>>,
    last_dyn: HashMap<ThreadId, DynAcc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaKind {
    Mem,
    Mutex,
}

/// Per-location metadata. The history is dropped when the location dies;
/// the arena slot is never reused within a run, so summary ids stay valid.
#[derive(Debug)]
struct Meta {
    kind: MetaKind,
    histo: Option<AccHisto>,
}

/// Cond-var bookkeeping: pending signals and broadcasts per waiter.
#[derive(Debug, Default)]
struct CondMeta {
    curr_signal_id: u32,
    wait_map: BTreeMap<ThreadId, WaitInfo>,
}

#[derive(Debug, Default)]
struct WaitInfo {
    timed: bool,
    broadcasted: bool,
    broadcast_vc: VectorClock,
    signal_map: BTreeMap<u32, VectorClock>,
}

/// Barrier bookkeeping: double-buffered wait tables so that back-to-back
/// barrier rounds do not mix clocks.
#[derive(Debug, Default)]
struct BarrierMeta {
    pre_using_table1: bool,
    post_using_table1: bool,
    table1: BTreeMap<ThreadId, (VectorClock, bool)>,
    table2: BTreeMap<ThreadId, (VectorClock, bool)>,
}

impl BarrierMeta {
    fn new() -> Self {
        Self { pre_using_table1: true, post_using_table1: true, ..Self::default() }
    }
}

/// Escalation state deciding when a location counts as shared.
#[derive(Debug, Default)]
struct SharedMeta {
    shared: bool,
    has_write: bool,
    multi_read: bool,
    last_thd: Option<ThreadId>,
    first_inst: Option<Arc<Inst>>,
}

/// One recent access of a thread, used to find local pairs for compound
/// idioms.
#[derive(Debug)]
struct RiEntry {
    thd_clk: Timestamp,
    acc_sum: Option<AccSumId>,
    vc: VectorClock,
    ls: LockSet,
    meta: MetaId,
}

#[derive(Debug, Default)]
struct RecentInfo {
    entries: Vec<RiEntry>,
    /// Latest un-matured entry index per location.
    raw_index: HashMap<MetaId, usize>,
}

/// A validated idiom-5 local pair awaiting its remote counterpart.
#[derive(Debug, Clone, Copy)]
struct LocalPair {
    prev_acc: AccSumId,
    curr_acc: AccSumId,
    succ: AccSumId,
    pred: AccSumId,
}

/// A lock→lock local pair that may combine into a deadlock cycle.
#[derive(Debug, Clone)]
struct DeadlockPair {
    prev_acc: AccSumId,
    curr_acc: AccSumId,
    prev_meta: MetaId,
    curr_meta: MetaId,
    prev_vc: VectorClock,
    curr_vc: VectorClock,
}

/// The iRoot predictor analyzer.
pub struct Predictor {
    iroot_db: Arc<IrootDb>,
    memo: Arc<Memo>,
    sinst_db: Arc<SharedInstDb>,

    sync_only: bool,
    complex_idioms: bool,
    single_var_idioms: bool,
    racy_only: bool,
    predict_deadlock: bool,
    ignore_lib: bool,
    unit_size: u64,
    vw: u64,

    metas: Vec<Meta>,
    meta_table: HashMap<Address, MetaId>,
    cond_metas: HashMap<Address, CondMeta>,
    barrier_metas: HashMap<Address, BarrierMeta>,
    shared_metas: HashMap<Address, SharedMeta>,

    filter: RegionFilter,
    curr_vc: HashMap<ThreadId, VectorClock>,
    curr_ls: HashMap<ThreadId, LockSet>,
    async_start: HashMap<ThreadId, Timestamp>,
    atomic_insts: HashSet<InstId>,

    acc_sums: Vec<AccSum>,
    acc_sum_index: HashMap<u64, Vec<AccSumId>>,
    succ_index: HashMap<AccSumId, Vec<AccSumId>>,
    pred_index: HashMap<AccSumId, Vec<AccSumId>>,
    pair_counts: HashMap<(AccSumId, AccSumId), CountPair>,

    ri_table: HashMap<ThreadId, RecentInfo>,
    lp_table: HashMap<ThreadId, Vec<LocalPair>>,
    lp_pair_set: HashSet<(AccSumId, AccSumId)>,
    dl_table: HashMap<ThreadId, Vec<DeadlockPair>>,
}

impl Predictor {
    pub fn new(
        opts: &Options,
        iroot_db: Arc<IrootDb>,
        memo: Arc<Memo>,
        sinst_db: Arc<SharedInstDb>,
    ) -> Self {
        Self {
            iroot_db,
            memo,
            sinst_db,
            sync_only: opts.sync_only,
            complex_idioms: opts.complex_idioms,
            single_var_idioms: opts.single_var_idioms,
            racy_only: opts.racy_only,
            predict_deadlock: opts.predict_deadlock,
            ignore_lib: opts.ignore_lib,
            unit_size: opts.unit_size,
            vw: opts.vw,
            metas: Vec::new(),
            meta_table: HashMap::new(),
            cond_metas: HashMap::new(),
            barrier_metas: HashMap::new(),
            shared_metas: HashMap::new(),
            filter: RegionFilter::new(),
            curr_vc: HashMap::new(),
            curr_ls: HashMap::new(),
            async_start: HashMap::new(),
            atomic_insts: HashSet::new(),
            acc_sums: Vec::new(),
            acc_sum_index: HashMap::new(),
            succ_index: HashMap::new(),
            pred_index: HashMap::new(),
            pair_counts: HashMap::new(),
            ri_table: HashMap::new(),
            lp_table: HashMap::new(),
            lp_pair_set: HashSet::new(),
            dl_table: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Meta management
    // -----------------------------------------------------------------------

    fn mem_meta(&mut self, iaddr: Address) -> Option<MetaId> {
        match self.meta_table.get(&iaddr) {
            None => {
                let id = self.metas.len();
                self.metas.push(Meta { kind: MetaKind::Mem, histo: Some(AccHisto::default()) });
                self.meta_table.insert(iaddr, id);
                Some(id)
            }
            Some(&id) => match self.metas[id].kind {
                MetaKind::Mem => Some(id),
                // A plain access aliased onto a sync variable; ignore it.
                MetaKind::Mutex => None,
            },
        }
    }

    fn mutex_meta(&mut self, iaddr: Address) -> MetaId {
        match self.meta_table.get(&iaddr) {
            None => {
                let id = self.metas.len();
                self.metas.push(Meta { kind: MetaKind::Mutex, histo: Some(AccHisto::default()) });
                self.meta_table.insert(iaddr, id);
                id
            }
            Some(&id) => match self.metas[id].kind {
                MetaKind::Mutex => id,
                MetaKind::Mem => {
                    // The location turned out to be a mutex after all.
                    self.process_free(id);
                    let new_id = self.metas.len();
                    self.metas
                        .push(Meta { kind: MetaKind::Mutex, histo: Some(AccHisto::default()) });
                    self.meta_table.insert(iaddr, new_id);
                    new_id
                }
            },
        }
    }

    fn alloc_region(&mut self, addr: Address, size: usize) {
        if addr == 0 || size == 0 {
            return;
        }
        self.filter.add(addr, size);
    }

    fn free_region(&mut self, addr: Address) {
        if addr == 0 {
            return;
        }
        let size = self.filter.remove(addr);
        let start = self.unit_down(addr);
        let end = self.unit_up(addr + size as Address);
        let mut iaddr = start;
        while iaddr < end {
            self.cond_metas.remove(&iaddr);
            self.barrier_metas.remove(&iaddr);
            self.shared_metas.remove(&iaddr);
            if let Some(meta_id) = self.meta_table.remove(&iaddr) {
                self.process_free(meta_id);
            }
            iaddr += self.unit_size;
        }
    }

    fn unit_down(&self, addr: Address) -> Address {
        addr & !(self.unit_size - 1)
    }

    fn unit_up(&self, addr: Address) -> Address {
        (addr + self.unit_size - 1) & !(self.unit_size - 1)
    }

    fn skip_inst(&self, inst: &Arc<Inst>) -> bool {
        self.ignore_lib && inst.image().is_common_lib()
    }

    // -----------------------------------------------------------------------
    // Shared-access escalation
    // -----------------------------------------------------------------------

    /// Decide whether this unit access counts as shared, updating the
    /// escalation state and promoting instructions into the shared-inst
    /// database as evidence accumulates.
    fn check_shared(
        &mut self,
        thd: ThreadId,
        inst: &Arc<Inst>,
        iaddr: Address,
        is_write: bool,
    ) -> bool {
        let sm = self.shared_metas.entry(iaddr).or_default();
        if sm.last_thd.is_none() && !sm.shared {
            if self.sinst_db.shared(inst) {
                sm.shared = true;
                return true;
            }
            sm.has_write = is_write;
            sm.last_thd = Some(thd);
            sm.first_inst = Some(Arc::clone(inst));
            return false;
        }
        if sm.shared {
            self.sinst_db.set_shared(inst);
            return true;
        }
        if self.sinst_db.shared(inst) {
            sm.shared = true;
            if let Some(first) = &sm.first_inst {
                self.sinst_db.set_shared(first);
            }
            return true;
        }
        if is_write {
            sm.has_write = true;
            if sm.last_thd != Some(thd) || sm.multi_read {
                sm.shared = true;
                self.sinst_db.set_shared(inst);
                if let Some(first) = &sm.first_inst {
                    self.sinst_db.set_shared(first);
                }
                return true;
            }
        } else if sm.last_thd != Some(thd) {
            if sm.has_write {
                sm.shared = true;
                self.sinst_db.set_shared(inst);
                if let Some(first) = &sm.first_inst {
                    self.sinst_db.set_shared(first);
                }
                return true;
            }
            sm.multi_read = true;
            sm.last_thd = Some(thd);
        }
        false
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn mem_access(
        &mut self,
        thd: ThreadId,
        clk: Timestamp,
        inst: &Arc<Inst>,
        addr: Address,
        size: usize,
        kind: EventKind,
    ) {
        if self.sync_only || self.skip_inst(inst) || !self.filter.contains(addr) {
            return;
        }
        let start = self.unit_down(addr);
        let end = self.unit_up(addr + size as Address);
        let is_write = kind == EventKind::MemWrite;
        let mut iaddr = start;
        while iaddr < end {
            if self.check_shared(thd, inst, iaddr, is_write) {
                if let Some(meta_id) = self.mem_meta(iaddr) {
                    self.process_iroot_event(thd, clk, kind, inst, meta_id);
                }
            }
            iaddr += self.unit_size;
        }
    }

    fn thread_start(&mut self, thd: ThreadId, parent: Option<ThreadId>) {
        let mut vc = VectorClock::new();
        vc.increment(thd);
        if let Some(parent) = parent {
            if let Some(parent_vc) = self.curr_vc.get_mut(&parent) {
                vc.join(parent_vc);
                parent_vc.increment(parent);
            }
        }
        self.curr_vc.insert(thd, vc);
        self.curr_ls.insert(thd, LockSet::new());
    }

    fn mutex_lock(&mut self, thd: ThreadId, clk: Timestamp, inst: &Arc<Inst>, addr: Address) {
        let meta_id = self.mutex_meta(addr);
        self.process_iroot_event(thd, clk, EventKind::MutexLock, inst, meta_id);
        self.curr_ls.entry(thd).or_default().add(addr);
    }

    fn mutex_unlock(&mut self, thd: ThreadId, clk: Timestamp, inst: &Arc<Inst>, addr: Address) {
        let meta_id = self.mutex_meta(addr);
        self.curr_ls.entry(thd).or_default().remove(addr);
        self.process_iroot_event(thd, clk, EventKind::MutexUnlock, inst, meta_id);
    }

    fn atomic_before(&mut self, thd: ThreadId, inst: &Arc<Inst>, op: AtomicOp, addr: Address) {
        self.atomic_insts.insert(inst.id());
        // Heuristic: a locked decrement in libc is the unlock fast path.
        if inst.image().is_libc() && op == AtomicOp::Dec {
            let unit = self.unit_down(addr);
            self.curr_ls.entry(thd).or_default().remove(unit);
        }
    }

    fn atomic_after(&mut self, thd: ThreadId, inst: &Arc<Inst>, op: AtomicOp, addr: Address) {
        // Heuristic: a successful cmpxchg in libc is the lock fast path.
        if inst.image().is_libc() && op == AtomicOp::Cmpxchg {
            let unit = self.unit_down(addr);
            self.curr_ls.entry(thd).or_default().add(unit);
        }
    }

    fn join(&mut self, thd: ThreadId, child: ThreadId) {
        if let Some(child_vc) = self.curr_vc.get(&child).cloned() {
            self.curr_vc.entry(thd).or_default().join(&child_vc);
        }
    }

    fn signal(&mut self, thd: ThreadId, addr: Address) {
        let vc = self.curr_vc.entry(thd).or_default().clone();
        let meta = self.cond_metas.entry(addr).or_default();
        meta.curr_signal_id += 1;
        let signal_id = meta.curr_signal_id;
        for wait_info in meta.wait_map.values_mut() {
            if !wait_info.broadcasted {
                wait_info.signal_map.insert(signal_id, vc.clone());
            }
        }
        self.curr_vc.entry(thd).or_default().increment(thd);
    }

    fn broadcast(&mut self, thd: ThreadId, addr: Address) {
        let vc = self.curr_vc.entry(thd).or_default().clone();
        let meta = self.cond_metas.entry(addr).or_default();
        for wait_info in meta.wait_map.values_mut() {
            if !wait_info.broadcasted {
                wait_info.broadcasted = true;
                wait_info.broadcast_vc = vc.clone();
            }
        }
        self.curr_vc.entry(thd).or_default().increment(thd);
    }

    fn pre_wait(&mut self, thd: ThreadId, addr: Address, timed: bool) {
        let meta = self.cond_metas.entry(addr).or_default();
        let wait_info = meta.wait_map.entry(thd).or_default();
        wait_info.timed = timed;
        wait_info.broadcasted = false;
        wait_info.signal_map.clear();
    }

    fn post_wait(&mut self, thd: ThreadId, addr: Address) {
        let meta = self.cond_metas.entry(addr).or_default();
        let Some(wait_info) = meta.wait_map.remove(&thd) else {
            return;
        };
        if wait_info.signal_map.is_empty() {
            if wait_info.broadcasted {
                self.curr_vc.entry(thd).or_default().join(&wait_info.broadcast_vc);
            }
            // Otherwise a timed wait expired; no ordering was created.
        } else {
            let (&signal_id, signal_vc) = wait_info.signal_map.iter().next().unwrap();
            self.curr_vc.entry(thd).or_default().join(signal_vc);
            // The signal is consumed: no other waiter may pair with it.
            for other in meta.wait_map.values_mut() {
                other.signal_map.remove(&signal_id);
            }
        }
        // Step past the joined clock so the wake strictly follows the
        // signal-side events.
        self.curr_vc.entry(thd).or_default().increment(thd);
    }

    fn pre_barrier(&mut self, thd: ThreadId, addr: Address) {
        let vc = self.curr_vc.entry(thd).or_default().clone();
        let meta = self.barrier_metas.entry(addr).or_insert_with(BarrierMeta::new);
        let table = if meta.pre_using_table1 { &mut meta.table1 } else { &mut meta.table2 };
        table.insert(thd, (vc, false));
    }

    fn post_barrier(&mut self, thd: ThreadId, addr: Address) {
        let mut joined = self.curr_vc.entry(thd).or_default().clone();
        let meta = self.barrier_metas.entry(addr).or_insert_with(BarrierMeta::new);
        let table = if meta.post_using_table1 { &mut meta.table1 } else { &mut meta.table2 };
        let mut all_flagged = true;
        let mut none_flagged = true;
        for (&waiter, entry) in table.iter_mut() {
            if waiter == thd {
                entry.1 = true;
            } else if entry.1 {
                none_flagged = false;
            } else {
                all_flagged = false;
            }
            joined.join(&entry.0);
        }
        joined.increment(thd);
        self.curr_vc.insert(thd, joined);
        if none_flagged {
            meta.pre_using_table1 = !meta.pre_using_table1;
        }
        if all_flagged {
            table.clear();
            meta.post_using_table1 = !meta.post_using_table1;
        }
    }

    fn syscall_entry(&mut self, thd: ThreadId, clk: Timestamp, num: i64) {
        if ASYNC_SYSCALLS.contains(&num) {
            self.async_start.entry(thd).or_insert(clk);
        }
    }

    fn signal_received(&mut self, thd: ThreadId, clk: Timestamp, num: i32) {
        if ASYNC_SIGNALS.contains(&num) {
            self.async_start.entry(thd).or_insert(clk);
        }
    }

    // -----------------------------------------------------------------------
    // Access summaries and the pair graph
    // -----------------------------------------------------------------------

    fn hash_dyn(&self, dyn_acc: &DynAcc) -> u64 {
        (dyn_acc.meta as u64)
            .wrapping_add(dyn_acc.thd as u64)
            .wrapping_add(dyn_acc.kind as u64)
            .wrapping_add(dyn_acc.inst.id() as u64)
            .wrapping_add(dyn_acc.fls.weak_hash())
    }

    fn match_acc_sum(&self, dyn_acc: &DynAcc) -> Option<AccSumId> {
        let bucket = self.acc_sum_index.get(&self.hash_dyn(dyn_acc))?;
        bucket
            .iter()
            .copied()
            .find(|&id| {
                let a = &self.acc_sums[id];
                a.meta == dyn_acc.meta
                    && a.thd == dyn_acc.thd
                    && a.kind == dyn_acc.kind
                    && a.inst.id() == dyn_acc.inst.id()
                    && a.fls == dyn_acc.fls
            })
    }

    fn pair_exists(&self, src: AccSumId, dst: AccSumId) -> bool {
        self.succ_index
            .get(&src)
            .is_some_and(|succs| succs.contains(&dst))
    }

    /// Number of earlier time-info entries this thread produced on the
    /// summary's location before the summary's latest entry began.
    fn num_acc_before(&self, acc_sum_id: AccSumId) -> u32 {
        let acc_sum = &self.acc_sums[acc_sum_id];
        let start = acc_sum.last_range().start;
        let Some(histo) = self.metas[acc_sum.meta].histo.as_ref() else {
            return 0;
        };
        let Some(ids) = histo.acc_sums.get(&acc_sum.thd) else {
            return 0;
        };
        let mut count = 0;
        for &id in ids {
            for (_, range) in &self.acc_sums[id].tinfo {
                if range.start < start {
                    count += 1;
                }
            }
        }
        count
    }

    fn add_pair(&mut self, src: AccSumId, dst: AccSumId) {
        if self.acc_sums[src].kind.is_mem() && self.acc_sums[dst].kind.is_mem() {
            let counts = CountPair {
                src_count: self.num_acc_before(src),
                dst_count: self.num_acc_before(dst),
            };
            self.pair_counts.insert((src, dst), counts);
        }
        self.succ_index.entry(src).or_default().push(dst);
        self.pred_index.entry(dst).or_default().push(src);
    }

    /// Whether some vector-clock entry of the remote summary is concurrent
    /// with `vc`, scanning newest first.
    fn check_concurrent(vc: &VectorClock, rmt: &AccSum) -> bool {
        for (entry_vc, _) in rmt.tinfo.iter().rev() {
            if entry_vc.happens_before(vc) {
                return false;
            }
            if !vc.happens_before(entry_vc) {
                return true;
            }
        }
        false
    }

    /// An atomic read-modify-write may not split: its read half cannot be
    /// a dependency source, its write half cannot be a destination.
    fn check_atomic(&self, src: AccSumId, dst: AccSumId) -> bool {
        let src = &self.acc_sums[src];
        let dst = &self.acc_sums[dst];
        if self.atomic_insts.contains(&src.inst.id()) && src.kind == EventKind::MemRead {
            return false;
        }
        if self.atomic_insts.contains(&dst.inst.id()) && dst.kind == EventKind::MemWrite {
            return false;
        }
        true
    }

    /// With `racy_only`, memory pairs protected by a common lock at both
    /// ends are considered race-free and dropped.
    fn check_racy(&self, src: AccSumId, dst: AccSumId) -> bool {
        if !self.racy_only {
            return true;
        }
        let src = &self.acc_sums[src];
        let dst = &self.acc_sums[dst];
        if !src.kind.is_mem() || !dst.kind.is_mem() {
            return true;
        }
        src.fls.is_empty() || dst.fls.is_empty() || src.fls.excludes(&dst.fls)
    }

    fn pair_allowed(&self, src: AccSumId, dst: AccSumId) -> bool {
        let src_sum = &self.acc_sums[src];
        let dst_sum = &self.acc_sums[dst];
        src_sum.kind.conflicts_with(dst_sum.kind)
            && !self.pair_exists(src, dst)
            && src_sum.fls.excludes(&dst_sum.fls)
            && self.check_atomic(src, dst)
            && self.check_racy(src, dst)
    }

    /// Fold the closed dynamic access into its access summary and search
    /// the other threads' summaries on the same location for new pairs.
    fn process_acc_sum_update(&mut self, dyn_acc: DynAcc) -> AccSumId {
        let mut skip_search = false;
        let curr_id = match self.match_acc_sum(&dyn_acc) {
            Some(id) => {
                let acc_sum = &mut self.acc_sums[id];
                let last = acc_sum.tinfo.last_mut().expect("summary has a time entry");
                if dyn_acc.vc == last.0 {
                    last.1.extend(dyn_acc.thd_clk);
                    skip_search = true;
                } else {
                    acc_sum.tinfo.push((dyn_acc.vc.clone(), ThdClkRange::new(dyn_acc.thd_clk)));
                }
                id
            }
            None => {
                let id = self.acc_sums.len();
                self.acc_sums.push(AccSum {
                    meta: dyn_acc.meta,
                    thd: dyn_acc.thd,
                    kind: dyn_acc.kind,
                    inst: Arc::clone(&dyn_acc.inst),
                    fls: dyn_acc.fls.clone(),
                    tinfo: vec![(dyn_acc.vc.clone(), ThdClkRange::new(dyn_acc.thd_clk))],
                });
                let hash = self.hash_dyn(&dyn_acc);
                self.acc_sum_index.entry(hash).or_default().push(id);
                if let Some(histo) = self.metas[dyn_acc.meta].histo.as_mut() {
                    histo.acc_sums.entry(dyn_acc.thd).or_default().push(id);
                }
                id
            }
        };

        if !skip_search {
            let mut remote_ids: Vec<AccSumId> = Vec::new();
            if let Some(histo) = self.metas[dyn_acc.meta].histo.as_ref() {
                for (&thd, ids) in &histo.acc_sums {
                    if thd != dyn_acc.thd {
                        remote_ids.extend_from_slice(ids);
                    }
                }
            }
            for rmt_id in remote_ids {
                if self.pair_allowed(rmt_id, curr_id)
                    && Self::check_concurrent(&dyn_acc.vc, &self.acc_sums[rmt_id])
                {
                    self.add_pair(rmt_id, curr_id);
                }
                if self.pair_allowed(curr_id, rmt_id)
                    && Self::check_concurrent(&dyn_acc.vc, &self.acc_sums[rmt_id])
                {
                    self.add_pair(curr_id, rmt_id);
                }
            }
        }
        curr_id
    }

    /// The non-concurrent pair pass, run when a location dies.
    ///
    /// Summaries ordered by synchronization in this run can still reorder
    /// under another schedule unless a barrier-like frontier separates
    /// them. Per thread, time-info entries collapse into a vector of
    /// unique clock values carrying the earliest and latest summaries of
    /// that clock range; each entry then links from its immediate
    /// predecessor in every other thread, skipping predecessors already
    /// ordered before an older local entry.
    fn process_acc_sum_pair_update(&mut self, meta_id: MetaId) {
        struct TimedEntry {
            vc: VectorClock,
            first: AccSumId,
            last: AccSumId,
        }

        let Some(histo) = self.metas[meta_id].histo.as_ref() else {
            return;
        };
        if histo.acc_sums.len() < 2 {
            return;
        }

        let mut timed_table: BTreeMap<ThreadId, Vec<TimedEntry>> = BTreeMap::new();
        for (&thd, ids) in &histo.acc_sums {
            let timed_entries = timed_table.entry(thd).or_default();
            let mut cursors = vec![0usize; ids.len()];
            let mut finished = 0usize;
            let total = ids.len();
            while finished != total {
                // First pass: the earliest unconsumed clock value.
                let mut earliest: Option<&VectorClock> = None;
                for (i, &id) in ids.iter().enumerate() {
                    let tinfo = &self.acc_sums[id].tinfo;
                    if cursors[i] == tinfo.len() {
                        continue;
                    }
                    let vc = &tinfo[cursors[i]].0;
                    match earliest {
                        None => earliest = Some(vc),
                        Some(e) => {
                            if vc.happens_before(e) {
                                earliest = Some(vc);
                            }
                        }
                    }
                }
                let earliest = earliest.expect("unfinished summary remains").clone();

                // Second pass: bracket the clock range and advance cursors.
                let mut first: Option<(AccSumId, Timestamp)> = None;
                let mut last: Option<(AccSumId, Timestamp)> = None;
                for (i, &id) in ids.iter().enumerate() {
                    let acc_sum = &self.acc_sums[id];
                    if cursors[i] == acc_sum.tinfo.len() {
                        continue;
                    }
                    let (vc, range) = &acc_sum.tinfo[cursors[i]];
                    if *vc != earliest {
                        continue;
                    }
                    match first {
                        None => first = Some((id, range.start)),
                        Some((_, t)) => {
                            if range.start < t
                                || (range.start == t && acc_sum.kind == EventKind::MemRead)
                            {
                                first = Some((id, range.start));
                            }
                        }
                    }
                    match last {
                        None => last = Some((id, range.end)),
                        Some((_, t)) => {
                            if range.end > t
                                || (range.end == t && acc_sum.kind == EventKind::MemWrite)
                            {
                                last = Some((id, range.end));
                            }
                        }
                    }
                    cursors[i] += 1;
                    if cursors[i] == acc_sum.tinfo.len() {
                        finished += 1;
                    }
                }
                timed_entries.push(TimedEntry {
                    vc: earliest,
                    first: first.expect("range has a first summary").0,
                    last: last.expect("range has a last summary").0,
                });
            }
        }

        // Immediate-predecessor linking across threads.
        let mut new_pairs: Vec<(AccSumId, AccSumId)> = Vec::new();
        for (&curr_thd, curr_entries) in &timed_table {
            for (curr_i, curr_entry) in curr_entries.iter().enumerate() {
                let mut cand_preds: Vec<&TimedEntry> = Vec::new();
                for (&rmt_thd, rmt_entries) in &timed_table {
                    if rmt_thd == curr_thd {
                        continue;
                    }
                    let mut cand: Option<&TimedEntry> = None;
                    for rmt_entry in rmt_entries {
                        if rmt_entry.vc.happens_before(&curr_entry.vc) {
                            cand = Some(rmt_entry);
                        } else {
                            break;
                        }
                    }
                    if let Some(c) = cand {
                        cand_preds.push(c);
                    }
                }
                for (i, cand) in cand_preds.iter().enumerate() {
                    let dominated = cand_preds
                        .iter()
                        .enumerate()
                        .any(|(j, other)| i != j && cand.vc.happens_before(&other.vc));
                    if dominated {
                        continue;
                    }
                    if curr_i > 0 && cand.vc.happens_before(&curr_entries[curr_i - 1].vc) {
                        continue;
                    }
                    new_pairs.push((cand.last, curr_entry.first));
                }
            }
        }

        for (src, dst) in new_pairs {
            let allowed = {
                let src_sum = &self.acc_sums[src];
                let dst_sum = &self.acc_sums[dst];
                src_sum.kind.conflicts_with(dst_sum.kind)
                    && !self.pair_exists(src, dst)
                    && src_sum.fls.excludes(&dst_sum.fls)
                    && self.check_racy(src, dst)
            };
            if allowed {
                self.add_pair(src, dst);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recent info for compound idioms
    // -----------------------------------------------------------------------

    fn recent_info_update(
        &mut self,
        thd: ThreadId,
        clk: Timestamp,
        vc: VectorClock,
        ls: LockSet,
        meta_id: MetaId,
    ) {
        let ri = self.ri_table.entry(thd).or_default();
        let index = ri.entries.len();
        ri.entries.push(RiEntry { thd_clk: clk, acc_sum: None, vc, ls, meta: meta_id });
        ri.raw_index.insert(meta_id, index);
    }

    fn recent_info_maturize(&mut self, acc_sum_id: AccSumId) {
        let (thd, meta) = {
            let acc_sum = &self.acc_sums[acc_sum_id];
            (acc_sum.thd, acc_sum.meta)
        };
        if let Some(ri) = self.ri_table.get_mut(&thd) {
            if let Some(&index) = ri.raw_index.get(&meta) {
                let entry = &mut ri.entries[index];
                if entry.acc_sum.is_none() {
                    entry.acc_sum = Some(acc_sum_id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Main entries
    // -----------------------------------------------------------------------

    fn process_iroot_event(
        &mut self,
        thd: ThreadId,
        clk: Timestamp,
        kind: EventKind,
        inst: &Arc<Inst>,
        meta_id: MetaId,
    ) {
        let curr_vc = self.curr_vc.entry(thd).or_default().clone();
        let curr_ls = self.curr_ls.entry(thd).or_default().clone();

        let prev_dyn = self.metas[meta_id]
            .histo
            .as_mut()
            .and_then(|histo| histo.last_dyn.remove(&thd));

        let mut matured: Option<AccSumId> = None;
        let prev_ls = prev_dyn.as_ref().map(|d| d.ls.clone());
        if let Some(mut dyn_acc) = prev_dyn {
            dyn_acc.fls.update_last(&dyn_acc.ls.clone(), Some(&curr_ls));
            matured = Some(self.process_acc_sum_update(dyn_acc));
        }

        if self.complex_idioms {
            if let Some(acc_sum_id) = matured {
                self.recent_info_maturize(acc_sum_id);
            }
            self.recent_info_update(thd, clk, curr_vc.clone(), curr_ls.clone(), meta_id);
        }

        let mut fls = FlaggedLockSet::new();
        fls.update_first(prev_ls.as_ref(), &curr_ls);
        let dyn_acc = DynAcc {
            meta: meta_id,
            thd,
            thd_clk: clk,
            kind,
            inst: Arc::clone(inst),
            vc: curr_vc,
            ls: curr_ls,
            fls,
        };
        if let Some(histo) = self.metas[meta_id].histo.as_mut() {
            histo.last_dyn.insert(thd, dyn_acc);
        }
    }

    fn process_free(&mut self, meta_id: MetaId) {
        let Some(histo) = self.metas[meta_id].histo.as_mut() else {
            return;
        };
        let last_dyn: Vec<DynAcc> = histo.last_dyn.drain().map(|(_, d)| d).collect();
        for mut dyn_acc in last_dyn {
            dyn_acc.fls.update_last(&dyn_acc.ls.clone(), None);
            let acc_sum_id = self.process_acc_sum_update(dyn_acc);
            if self.complex_idioms {
                self.recent_info_maturize(acc_sum_id);
            }
        }
        self.process_acc_sum_pair_update(meta_id);
        self.metas[meta_id].histo = None;
    }

    fn check_async(&self, acc_sum_id: AccSumId) -> bool {
        let acc_sum = &self.acc_sums[acc_sum_id];
        match self.async_start.get(&acc_sum.thd) {
            None => false,
            Some(&start) => acc_sum.last_range().end > start,
        }
    }

    /// Intern and record one predicted iRoot.
    fn predict(&self, idiom: Idiom, accs: &[AccSumId]) -> Arc<Iroot> {
        let events: Vec<_> = accs
            .iter()
            .map(|&id| {
                let a = &self.acc_sums[id];
                self.iroot_db.get_event(&a.inst, a.kind)
            })
            .collect();
        let iroot = self.iroot_db.get_iroot(idiom, &events);
        self.memo.predicted(&iroot);
        let (a, b) = match idiom {
            Idiom::Idiom1 => (accs[0], accs[1]),
            Idiom::Idiom2 => (accs[2], accs[1]),
            Idiom::Idiom3 | Idiom::Idiom4 => (accs[3], accs[2]),
            Idiom::Idiom5 => (accs[3], accs[1]),
        };
        if self.check_async(a) || self.check_async(b) {
            self.memo.set_async(&iroot);
        }
        debug!("predictor: {}", iroot.to_display_string());
        iroot
    }

    /// Turn every pair-graph edge into an idiom-1 candidate.
    fn predict_idiom1(&self) {
        let mut edges = 0usize;
        for (&src, dsts) in &self.succ_index {
            for &dst in dsts {
                let iroot = self.predict(Idiom::Idiom1, &[src, dst]);
                if let Some(&counts) = self.pair_counts.get(&(src, dst)) {
                    iroot.merge_count_pair(counts);
                }
                edges += 1;
            }
        }
        info!("predictor: {edges} idiom-1 candidates");
    }

    /// Idiom-2/3/4 feasibility: the remote successor must be reachable
    /// after the local pair's first end, the remote predecessor before its
    /// second end, the successor's window must open before the
    /// predecessor's closes, and for multi-variable shapes the local
    /// common lock set must not pin the remote pair.
    fn check_compound(
        &self,
        prev_entry: &RiEntry,
        curr_entry: &RiEntry,
        succ: AccSumId,
        pred: AccSumId,
    ) -> bool {
        let succ_sum = &self.acc_sums[succ];
        let pred_sum = &self.acc_sums[pred];

        let mut succ_entry: Option<&(VectorClock, ThdClkRange)> = None;
        for entry in succ_sum.tinfo.iter().rev() {
            if !entry.0.happens_before(&prev_entry.vc) {
                succ_entry = Some(entry);
            } else {
                break;
            }
        }
        let Some(succ_entry) = succ_entry else {
            return false;
        };

        let mut pred_entry: Option<&(VectorClock, ThdClkRange)> = None;
        for entry in pred_sum.tinfo.iter() {
            if !curr_entry.vc.happens_before(&entry.0) {
                pred_entry = Some(entry);
            } else {
                break;
            }
        }
        let Some(pred_entry) = pred_entry else {
            return false;
        };

        if pred_entry.1.end < succ_entry.1.start {
            return false;
        }

        if prev_entry.meta != curr_entry.meta {
            let common = FlaggedLockSet::common_of(&prev_entry.ls, &curr_entry.ls);
            if !common.excludes(&succ_sum.fls) || !pred_sum.fls.excludes(&common) {
                return false;
            }
        }
        true
    }

    /// Idiom-5 feasibility: like `check_compound` but with the remote
    /// timing reversed — the predecessor's window must open before the
    /// successor's closes.
    fn check_compound2(
        &self,
        prev_entry: &RiEntry,
        curr_entry: &RiEntry,
        succ: AccSumId,
        pred: AccSumId,
    ) -> bool {
        let succ_sum = &self.acc_sums[succ];
        let pred_sum = &self.acc_sums[pred];

        let mut succ_entry: Option<&(VectorClock, ThdClkRange)> = None;
        for entry in succ_sum.tinfo.iter().rev() {
            if !entry.0.happens_before(&prev_entry.vc) {
                succ_entry = Some(entry);
                break;
            }
        }
        let Some(succ_entry) = succ_entry else {
            return false;
        };

        let mut pred_entry: Option<&(VectorClock, ThdClkRange)> = None;
        for entry in pred_sum.tinfo.iter() {
            if !curr_entry.vc.happens_before(&entry.0) {
                pred_entry = Some(entry);
                break;
            }
        }
        let Some(pred_entry) = pred_entry else {
            return false;
        };

        succ_entry.1.end >= pred_entry.1.start
    }

    fn check_deadlock(&self, dl: &DeadlockPair, rmt: &DeadlockPair) -> bool {
        if rmt.curr_vc.happens_before(&dl.prev_vc) {
            return false;
        }
        if dl.curr_vc.happens_before(&rmt.prev_vc) {
            return false;
        }
        let prev = &self.acc_sums[dl.prev_acc];
        let curr = &self.acc_sums[dl.curr_acc];
        let pred = &self.acc_sums[rmt.prev_acc];
        let succ = &self.acc_sums[rmt.curr_acc];
        prev.fls.excludes(&succ.fls) && pred.fls.excludes(&curr.fls)
    }

    /// Synthesize compound candidates from the recent-access logs.
    fn predict_complex(&mut self) {
        // Phase 1: idiom 2/3/4, plus idiom-5 local pairs.
        let thds: Vec<ThreadId> = self.ri_table.keys().copied().collect();
        for thd in thds {
            let num_entries = self.ri_table[&thd].entries.len();
            for curr_idx in 0..num_entries {
                let (curr_acc, curr_clk, curr_meta) = {
                    let entry = &self.ri_table[&thd].entries[curr_idx];
                    let Some(acc) = entry.acc_sum else { continue };
                    (acc, entry.thd_clk, entry.meta)
                };
                let Some(preds) = self.pred_index.get(&curr_acc).cloned() else {
                    continue;
                };

                let mut visited: HashSet<MetaId> = HashSet::new();
                for prev_idx in (0..curr_idx).rev() {
                    let (prev_acc, prev_clk, prev_meta) = {
                        let entry = &self.ri_table[&thd].entries[prev_idx];
                        let Some(acc) = entry.acc_sum else { continue };
                        (acc, entry.thd_clk, entry.meta)
                    };
                    if curr_clk.saturating_sub(prev_clk) >= self.vw {
                        break;
                    }
                    if visited.contains(&prev_meta) {
                        continue;
                    }

                    if let Some(succs) = self.succ_index.get(&prev_acc).cloned() {
                        for &succ in &succs {
                            let mut same_acc_sum = false;
                            for &pred in &preds {
                                if self.acc_sums[succ].thd != self.acc_sums[pred].thd {
                                    continue;
                                }
                                if succ == pred {
                                    same_acc_sum = true;
                                    continue;
                                }
                                let (prev_entry, curr_entry) = {
                                    let entries = &self.ri_table[&thd].entries;
                                    (&entries[prev_idx], &entries[curr_idx])
                                };
                                if prev_meta == curr_meta {
                                    if self.check_compound(prev_entry, curr_entry, succ, pred) {
                                        self.predict(
                                            Idiom::Idiom3,
                                            &[prev_acc, succ, pred, curr_acc],
                                        );
                                    }
                                } else if !self.single_var_idioms {
                                    if self.check_compound(prev_entry, curr_entry, succ, pred) {
                                        self.predict(
                                            Idiom::Idiom4,
                                            &[prev_acc, succ, pred, curr_acc],
                                        );
                                    }
                                    if self.check_compound2(prev_entry, curr_entry, succ, pred) {
                                        self.lp_table.entry(thd).or_default().push(LocalPair {
                                            prev_acc,
                                            curr_acc,
                                            succ,
                                            pred,
                                        });
                                        self.lp_pair_set.insert((prev_acc, curr_acc));
                                    }
                                }
                            }
                            if same_acc_sum {
                                let (prev_entry, curr_entry) = {
                                    let entries = &self.ri_table[&thd].entries;
                                    (&entries[prev_idx], &entries[curr_idx])
                                };
                                if self.check_compound(prev_entry, curr_entry, succ, succ) {
                                    self.predict(Idiom::Idiom2, &[prev_acc, succ, curr_acc]);
                                }
                            }
                        }
                    }

                    if !self.single_var_idioms
                        && self.predict_deadlock
                        && self.acc_sums[prev_acc].kind == EventKind::MutexLock
                        && self.acc_sums[curr_acc].kind == EventKind::MutexLock
                    {
                        let entries = &self.ri_table[&thd].entries;
                        let dl = DeadlockPair {
                            prev_acc,
                            curr_acc,
                            prev_meta,
                            curr_meta,
                            prev_vc: entries[prev_idx].vc.clone(),
                            curr_vc: entries[curr_idx].vc.clone(),
                        };
                        self.dl_table.entry(thd).or_default().push(dl);
                    }

                    if prev_meta == curr_meta {
                        break;
                    }
                    visited.insert(prev_meta);
                }
            }
        }

        // Phase 2: idiom 5 from mirrored local pairs.
        let lp_table = std::mem::take(&mut self.lp_table);
        for (_, lps) in &lp_table {
            for lp in lps {
                if self.lp_pair_set.contains(&(lp.pred, lp.succ)) {
                    self.predict(Idiom::Idiom5, &[lp.prev_acc, lp.succ, lp.pred, lp.curr_acc]);
                }
            }
        }
        self.lp_table = lp_table;

        // Deadlock-shaped idiom 5: nested lock pairs crossing over.
        if self.predict_deadlock {
            let dl_table = std::mem::take(&mut self.dl_table);
            for (&thd, dls) in &dl_table {
                for dl in dls {
                    for (&rmt_thd, rmt_dls) in &dl_table {
                        if rmt_thd == thd {
                            continue;
                        }
                        for rmt_dl in rmt_dls {
                            if dl.prev_meta != rmt_dl.curr_meta
                                || dl.curr_meta != rmt_dl.prev_meta
                            {
                                continue;
                            }
                            if self.check_deadlock(dl, rmt_dl) {
                                self.predict(
                                    Idiom::Idiom5,
                                    &[dl.prev_acc, rmt_dl.curr_acc, rmt_dl.prev_acc, dl.curr_acc],
                                );
                            }
                        }
                    }
                }
            }
            self.dl_table = dl_table;
        }
    }
}

impl Analyzer for Predictor {
    fn name(&self) -> &'static str {
        "predictor"
    }

    fn event(&mut self, event: &Event) {
        match event {
            Event::ThreadStart { thd, parent } => self.thread_start(*thd, *parent),
            Event::ThreadExit { .. } => {
                // Location teardown flushes the remaining state.
            }
            Event::MemRead { thd, clk, inst, addr, size } => {
                self.mem_access(*thd, *clk, inst, *addr, *size, EventKind::MemRead);
            }
            Event::MemWrite { thd, clk, inst, addr, size } => {
                self.mem_access(*thd, *clk, inst, *addr, *size, EventKind::MemWrite);
            }
            Event::AtomicBefore { thd, inst, op, addr, .. } => {
                self.atomic_before(*thd, inst, *op, *addr);
            }
            Event::AtomicAfter { thd, inst, op, addr, .. } => {
                self.atomic_after(*thd, inst, *op, *addr);
            }
            Event::MutexLock { thd, clk, inst, addr } => {
                self.mutex_lock(*thd, *clk, inst, *addr);
            }
            Event::MutexUnlock { thd, clk, inst, addr } => {
                self.mutex_unlock(*thd, *clk, inst, *addr);
            }
            Event::CondSignal { thd, addr, .. } => self.signal(*thd, *addr),
            Event::CondBroadcast { thd, addr, .. } => self.broadcast(*thd, *addr),
            Event::CondWaitBefore { thd, clk, inst, cond, mutex, timed } => {
                self.mutex_unlock(*thd, *clk, inst, *mutex);
                self.pre_wait(*thd, *cond, *timed);
            }
            Event::CondWaitAfter { thd, clk, inst, cond, mutex, .. } => {
                self.post_wait(*thd, *cond);
                self.mutex_lock(*thd, *clk, inst, *mutex);
            }
            Event::BarrierWaitBefore { thd, addr, .. } => self.pre_barrier(*thd, *addr),
            Event::BarrierWaitAfter { thd, addr, .. } => self.post_barrier(*thd, *addr),
            Event::Join { thd, child, .. } => self.join(*thd, *child),
            Event::RegionAlloc { addr, size, .. } => self.alloc_region(*addr, *size),
            Event::RegionFree { addr, .. } => self.free_region(*addr),
            Event::SyscallEntry { thd, clk, num } => self.syscall_entry(*thd, *clk, *num),
            Event::SignalReceived { thd, clk, num } => self.signal_received(*thd, *clk, *num),
        }
    }

    fn program_exit(&mut self) {
        for meta_id in 0..self.metas.len() {
            self.process_free(meta_id);
        }
        self.predict_idiom1();
        if self.complex_idioms {
            self.predict_complex();
        }
        info!(
            "predictor: {} candidates over {} summaries",
            self.memo.total_predicted(),
            self.acc_sums.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;

    struct Rig {
        _reg: StaticRegistry,
        db: Arc<IrootDb>,
        memo: Arc<Memo>,
        pred: Predictor,
        insts: Vec<Arc<Inst>>,
        clks: HashMap<ThreadId, Timestamp>,
    }

    impl Rig {
        fn new(opts: Options) -> Self {
            let reg = StaticRegistry::new();
            let img = reg.intern_image("/usr/bin/app");
            let insts: Vec<Arc<Inst>> =
                (0..12).map(|i| reg.intern_inst(&img, 0x100 + i * 4)).collect();
            let db = Arc::new(IrootDb::new());
            let memo = Arc::new(Memo::new(Arc::clone(&db)));
            let sinst = Arc::new(SharedInstDb::new());
            // Pretend an earlier run already classified these instructions
            // as shared, so the escalation protocol does not swallow the
            // first accesses.
            for inst in &insts {
                sinst.set_shared(inst);
            }
            let mut pred = Predictor::new(&opts, Arc::clone(&db), Arc::clone(&memo), sinst);
            pred.event(&Event::ThreadStart { thd: 1, parent: None });
            pred.event(&Event::ThreadStart { thd: 2, parent: Some(1) });
            pred.event(&Event::RegionAlloc { thd: 1, clk: 0, addr: 0x1000, size: 0x1000 });
            pred.event(&Event::RegionAlloc { thd: 1, clk: 0, addr: 0x8000, size: 0x100 });
            Rig { _reg: reg, db, memo, pred, insts, clks: HashMap::new() }
        }

        fn clk(&mut self, thd: ThreadId) -> Timestamp {
            let c = self.clks.entry(thd).or_insert(0);
            *c += 1;
            *c
        }

        fn read(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.pred.event(&Event::MemRead {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
                size: 4,
            });
        }

        fn write(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.pred.event(&Event::MemWrite {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
                size: 4,
            });
        }

        fn lock(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.pred.event(&Event::MutexLock {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
            });
        }

        fn unlock(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.pred.event(&Event::MutexUnlock {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
            });
        }

        fn finish(&mut self) {
            self.pred.program_exit();
        }

        fn idioms(&self) -> Vec<Idiom> {
            self.db.iroots().iter().map(|r| r.idiom()).collect()
        }
    }

    #[test]
    fn conflicting_remote_accesses_predict_idiom1() {
        let mut rig = Rig::new(Options::default());
        // Writes from two threads with no synchronization.
        rig.write(1, 0, 0x1000);
        rig.write(2, 1, 0x1000);
        rig.write(1, 0, 0x1000);
        rig.finish();
        assert!(rig.idioms().contains(&Idiom::Idiom1));
        assert!(rig.memo.total_predicted() >= 2, "both directions expected");
    }

    #[test]
    fn single_thread_predicts_nothing() {
        let mut rig = Rig::new(Options::default());
        rig.write(1, 0, 0x1000);
        rig.read(1, 1, 0x1000);
        rig.write(1, 2, 0x1000);
        rig.finish();
        assert_eq!(rig.memo.total_predicted(), 0);
    }

    #[test]
    fn fork_ordering_suppresses_prediction() {
        // Accesses ordered by thread creation cannot reorder: the parent
        // wrote before the child existed.
        let reg = StaticRegistry::new();
        let img = reg.intern_image("/usr/bin/app");
        let i0 = reg.intern_inst(&img, 0x10);
        let i1 = reg.intern_inst(&img, 0x14);
        let db = Arc::new(IrootDb::new());
        let memo = Arc::new(Memo::new(Arc::clone(&db)));
        let sinst = Arc::new(SharedInstDb::new());
        // Pre-mark both instructions shared so the first accesses count.
        sinst.set_shared(&i0);
        sinst.set_shared(&i1);
        let opts = Options::default();
        let mut pred = Predictor::new(&opts, Arc::clone(&db), Arc::clone(&memo), sinst);
        pred.event(&Event::ThreadStart { thd: 1, parent: None });
        pred.event(&Event::RegionAlloc { thd: 1, clk: 0, addr: 0x1000, size: 0x100 });
        pred.event(&Event::MemWrite { thd: 1, clk: 1, inst: i0, addr: 0x1000, size: 4 });
        // The child starts after the write and inherits the parent clock.
        pred.event(&Event::ThreadStart { thd: 2, parent: Some(1) });
        pred.event(&Event::MemWrite { thd: 2, clk: 1, inst: i1, addr: 0x1000, size: 4 });
        pred.program_exit();
        // The only dependency is the one that already fired; the reverse
        // direction is impossible, so only the fired order is predicted.
        for iroot in db.iroots() {
            assert_eq!(iroot.event(0).inst().id(), 1, "w1 -> w2 only");
        }
    }

    #[test]
    fn lock_protected_accesses_predict_lock_pairs() {
        let mut rig = Rig::new(Options::default());
        let m = 0x8000;
        rig.lock(1, 2, m);
        rig.write(1, 0, 0x1000);
        rig.unlock(1, 3, m);
        rig.lock(2, 4, m);
        rig.write(2, 1, 0x1000);
        rig.unlock(2, 5, m);
        rig.finish();
        let idioms = rig.idioms();
        assert!(idioms.contains(&Idiom::Idiom1));
        // The unlock->lock dependency is among the candidates.
        let has_sync_pair = rig.db.iroots().iter().any(|r| {
            r.idiom() == Idiom::Idiom1
                && r.event(0).kind() == EventKind::MutexUnlock
                && r.event(1).kind() == EventKind::MutexLock
        });
        assert!(has_sync_pair);
    }

    #[test]
    fn shared_counter_predicts_idiom2() {
        let mut rig = Rig::new(Options { complex_idioms: true, ..Options::default() });
        let g = 0x1000;
        // T1: R(g); W(g)   T2: R(g); W(g) — classic lost update.
        rig.read(1, 0, g);
        rig.write(1, 1, g);
        rig.read(2, 2, g);
        rig.write(2, 3, g);
        rig.finish();
        let idioms = rig.idioms();
        assert!(idioms.contains(&Idiom::Idiom1));
        assert!(idioms.contains(&Idiom::Idiom2), "lost-update shape: {idioms:?}");
        // The remote read sits before the remote write, so no nested
        // same-variable shape is feasible here.
        assert!(!idioms.contains(&Idiom::Idiom3));
    }

    #[test]
    fn write_read_remote_pair_predicts_idiom3() {
        let mut rig = Rig::new(Options { complex_idioms: true, ..Options::default() });
        let g = 0x1000;
        // T1: R(g); W(g)   T2: W(g); R(g) — the remote pair brackets the
        // local one over the same location.
        rig.read(1, 0, g);
        rig.write(1, 1, g);
        rig.write(2, 2, g);
        rig.read(2, 3, g);
        rig.finish();
        let idioms = rig.idioms();
        assert!(idioms.contains(&Idiom::Idiom3), "got {idioms:?}");
    }

    #[test]
    fn two_locations_predict_idiom4() {
        let mut rig = Rig::new(Options { complex_idioms: true, ..Options::default() });
        let a = 0x1000;
        let b = 0x1100;
        rig.write(1, 0, a);
        rig.write(1, 1, b);
        rig.read(2, 2, a);
        rig.read(2, 3, b);
        rig.finish();
        let idioms = rig.idioms();
        assert!(idioms.contains(&Idiom::Idiom4), "got {idioms:?}");
    }

    #[test]
    fn single_var_knob_suppresses_idiom4() {
        let mut rig = Rig::new(Options {
            complex_idioms: true,
            single_var_idioms: true,
            ..Options::default()
        });
        let a = 0x1000;
        let b = 0x1100;
        rig.write(1, 0, a);
        rig.write(1, 1, b);
        rig.read(2, 2, a);
        rig.read(2, 3, b);
        rig.finish();
        let idioms = rig.idioms();
        assert!(!idioms.contains(&Idiom::Idiom4));
        assert!(!idioms.contains(&Idiom::Idiom5));
    }

    #[test]
    fn ab_ba_locks_predict_deadlock() {
        let mut rig = Rig::new(Options {
            complex_idioms: true,
            predict_deadlock: true,
            ..Options::default()
        });
        let m1 = 0x8000;
        let m2 = 0x8010;
        rig.lock(1, 0, m1);
        rig.lock(1, 1, m2);
        rig.unlock(1, 2, m2);
        rig.unlock(1, 3, m1);
        rig.lock(2, 4, m2);
        rig.lock(2, 5, m1);
        rig.unlock(2, 6, m1);
        rig.unlock(2, 7, m2);
        rig.finish();
        let idioms = rig.idioms();
        assert!(idioms.contains(&Idiom::Idiom5), "deadlock shape: {idioms:?}");
    }

    #[test]
    fn deadlock_knob_off_suppresses_idiom5_deadlocks() {
        let mut rig = Rig::new(Options { complex_idioms: true, ..Options::default() });
        let m1 = 0x8000;
        let m2 = 0x8010;
        rig.lock(1, 0, m1);
        rig.lock(1, 1, m2);
        rig.unlock(1, 2, m2);
        rig.unlock(1, 3, m1);
        rig.lock(2, 4, m2);
        rig.lock(2, 5, m1);
        rig.unlock(2, 6, m1);
        rig.unlock(2, 7, m2);
        rig.finish();
        assert!(!rig.idioms().contains(&Idiom::Idiom5));
    }

    #[test]
    fn window_bounds_compound_pairs() {
        let mut rig = Rig::new(Options {
            complex_idioms: true,
            vw: 4,
            ..Options::default()
        });
        let g = 0x1000;
        rig.read(1, 0, g);
        // Burn the window with accesses to another location.
        for _ in 0..6 {
            rig.write(1, 4, 0x1200);
        }
        rig.write(1, 1, g);
        rig.write(2, 3, g);
        rig.finish();
        // The local R/W pair spans more than vw instructions, so the
        // remote write must not complete an idiom 2.
        assert!(!rig.idioms().contains(&Idiom::Idiom2));
        // The plain dependencies are still there.
        assert!(rig.idioms().contains(&Idiom::Idiom1));
    }

    #[test]
    fn cond_signal_orders_waiter() {
        let reg = StaticRegistry::new();
        let img = reg.intern_image("/usr/bin/app");
        let insts: Vec<_> = (0..6).map(|i| reg.intern_inst(&img, 0x10 + i * 4)).collect();
        let db = Arc::new(IrootDb::new());
        let memo = Arc::new(Memo::new(Arc::clone(&db)));
        let sinst = Arc::new(SharedInstDb::new());
        for i in &insts {
            sinst.set_shared(i);
        }
        let opts = Options::default();
        let mut pred = Predictor::new(&opts, Arc::clone(&db), Arc::clone(&memo), sinst);
        let cond = 0x9000;
        let mutex = 0x9010;
        let cell = 0x1000;
        pred.event(&Event::ThreadStart { thd: 1, parent: None });
        pred.event(&Event::ThreadStart { thd: 2, parent: Some(1) });
        pred.event(&Event::RegionAlloc { thd: 1, clk: 0, addr: 0x1000, size: 0x100 });

        // T1 waits; T2 writes then signals; T1 wakes and reads.
        pred.event(&Event::MutexLock { thd: 1, clk: 1, inst: insts[0].clone(), addr: mutex });
        pred.event(&Event::CondWaitBefore {
            thd: 1, clk: 2, inst: insts[1].clone(), cond, mutex, timed: false,
        });
        pred.event(&Event::MemWrite { thd: 2, clk: 1, inst: insts[2].clone(), addr: cell, size: 4 });
        pred.event(&Event::CondSignal { thd: 2, clk: 2, inst: insts[3].clone(), addr: cond });
        pred.event(&Event::CondWaitAfter {
            thd: 1, clk: 3, inst: insts[1].clone(), cond, mutex, timed: false,
        });
        pred.event(&Event::MemRead { thd: 1, clk: 4, inst: insts[4].clone(), addr: cell, size: 4 });
        pred.event(&Event::MutexUnlock { thd: 1, clk: 5, inst: insts[5].clone(), addr: mutex });
        pred.program_exit();

        // The signal ordered W(cell) before R(cell): the only memory
        // candidate direction permitted by the clocks is W -> R.
        for iroot in db.iroots() {
            if iroot.idiom() == Idiom::Idiom1
                && iroot.event(0).is_mem()
                && iroot.event(1).is_mem()
            {
                assert_eq!(iroot.event(0).kind(), EventKind::MemWrite);
                assert_eq!(iroot.event(1).kind(), EventKind::MemRead);
            }
        }
    }

    #[test]
    fn free_purges_location_state() {
        let mut rig = Rig::new(Options::default());
        rig.write(1, 0, 0x1000);
        let clk = rig.clk(1);
        rig.pred.event(&Event::RegionFree { thd: 1, clk, addr: 0x1000 });
        // Accesses after the free land outside every region.
        rig.write(2, 1, 0x1000);
        rig.finish();
        assert_eq!(rig.memo.total_predicted(), 0);
    }

    #[test]
    fn atomic_rmw_read_cannot_be_source() {
        let mut rig = Rig::new(Options::default());
        let g = 0x1000;
        let clk = rig.clk(1);
        rig.pred.event(&Event::AtomicBefore {
            thd: 1, clk, inst: rig.insts[0].clone(), op: AtomicOp::Inc, addr: g,
        });
        rig.read(1, 0, g);
        rig.write(1, 0, g);
        rig.write(2, 1, g);
        rig.write(1, 0, g);
        rig.finish();
        for iroot in rig.db.iroots() {
            if iroot.event(0).inst().id() == rig.insts[0].id() {
                assert_ne!(
                    iroot.event(0).kind(),
                    EventKind::MemRead,
                    "rmw read half must not source a pair"
                );
            }
        }
    }

    #[test]
    fn sync_only_ignores_memory() {
        let mut rig = Rig::new(Options { sync_only: true, ..Options::default() });
        rig.write(1, 0, 0x1000);
        rig.write(2, 1, 0x1000);
        rig.finish();
        assert_eq!(rig.memo.total_predicted(), 0);
    }
}
