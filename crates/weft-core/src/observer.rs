//! Passive iRoot observer.
//!
//! Watches a live execution and records which iRoots actually fire. For
//! every new access the observer derives the set of immediate remote
//! predecessors (last conflicting accesses), records the corresponding
//! idiom-1 iRoots as observed, and — when compound idioms are enabled —
//! scans the thread's recent accesses within the vulnerability window to
//! recognize fired idiom-2/3/4/5 instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;

use crate::event::{Address, Event, Analyzer, ThreadId, Timestamp};
use crate::filter::RegionFilter;
use crate::iroot::{EventKind, Idiom, IrootDb};
use crate::lockset::LockSet;
use crate::memo::Memo;
use crate::options::Options;
use crate::registry::Inst;

/// Which local event sequences can bound a compound idiom.
///
/// The table must be identical on every run: candidate databases are
/// shared across runs, and a drifting table would make the same execution
/// produce different candidates.
pub fn lp_valid(prev: EventKind, curr: EventKind) -> bool {
    use EventKind::*;
    match (prev, curr) {
        // Any memory pair can delimit an unserializable interleaving.
        (MemRead | MemWrite, MemRead | MemWrite) => true,
        // Nested or successive acquisitions form deadlock-shaped bounds.
        (MutexLock, MutexLock) => true,
        // Release-then-acquire is a window another thread can slip into.
        (MutexUnlock, MutexLock) => true,
        // A lock/unlock of one critical section is not a boundary.
        (MutexLock, MutexUnlock) => false,
        (MutexUnlock, MutexUnlock) => false,
        // Memory against sync boundaries.
        (MemRead | MemWrite, MutexLock) => true,
        (MemRead | MemWrite, MutexUnlock) => false,
        (MutexUnlock, MemRead | MemWrite) => true,
        (MutexLock, MemRead | MemWrite) => false,
    }
}

/// One dynamic access, as the observer remembers it.
#[derive(Debug, Clone)]
struct Acc {
    uid: u64,
    thd: ThreadId,
    clk: Timestamp,
    kind: EventKind,
    inst: Arc<Inst>,
    ls: LockSet,
}

#[derive(Debug)]
enum Meta {
    Mem {
        last_writer: Option<Acc>,
        last_readers: HashMap<ThreadId, Acc>,
    },
    Mutex {
        last_unlocker: Option<Acc>,
    },
}

/// A recorded successor of a local access: a remote access that depended
/// on it.
#[derive(Debug, Clone)]
struct SuccEntry {
    succ: Acc,
}

#[derive(Debug)]
struct LocalEntry {
    addr: Address,
    acc: Acc,
    succs: Vec<SuccEntry>,
}

/// Per-thread recent access log keyed by local clock.
#[derive(Debug, Default)]
struct LocalInfo {
    entries: BTreeMap<Timestamp, Vec<LocalEntry>>,
}

/// The iRoot observer analyzer.
pub struct Observer {
    iroot_db: Arc<IrootDb>,
    memo: Arc<Memo>,
    shadow: bool,
    sync_only: bool,
    complex_idioms: bool,
    single_var_idioms: bool,
    ignore_lib: bool,
    unit_size: u64,
    vw: u64,
    filter: RegionFilter,
    curr_uid: u64,
    meta_table: HashMap<Address, Meta>,
    local_info: HashMap<ThreadId, LocalInfo>,
    curr_ls: HashMap<ThreadId, LockSet>,
}

impl Observer {
    pub fn new(opts: &Options, iroot_db: Arc<IrootDb>, memo: Arc<Memo>) -> Self {
        Self {
            iroot_db,
            memo,
            shadow: opts.shadow_observer,
            sync_only: opts.sync_only,
            complex_idioms: opts.complex_idioms,
            single_var_idioms: opts.single_var_idioms,
            ignore_lib: opts.ignore_lib,
            unit_size: opts.unit_size,
            vw: opts.vw,
            filter: RegionFilter::new(),
            curr_uid: 0,
            meta_table: HashMap::new(),
            local_info: HashMap::new(),
            curr_ls: HashMap::new(),
        }
    }

    fn next_uid(&mut self) -> u64 {
        self.curr_uid += 1;
        self.curr_uid
    }

    fn skip_inst(&self, inst: &Arc<Inst>) -> bool {
        self.ignore_lib && inst.image().is_common_lib()
    }

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
        let start = addr & !(self.unit_size - 1);
        let end = (addr + size as Address + self.unit_size - 1) & !(self.unit_size - 1);
        let mut iaddr = start;
        while iaddr < end {
            self.unit_access(thd, clk, inst, iaddr, kind);
            iaddr += self.unit_size;
        }
    }

    fn unit_access(
        &mut self,
        thd: ThreadId,
        clk: Timestamp,
        inst: &Arc<Inst>,
        iaddr: Address,
        kind: EventKind,
    ) {
        let uid = self.next_uid();
        let ls = self.curr_ls.entry(thd).or_default().clone();
        let curr = Acc { uid, thd, clk, kind, inst: Arc::clone(inst), ls };

        let meta = self.meta_table.entry(iaddr).or_insert_with(|| Meta::Mem {
            last_writer: None,
            last_readers: HashMap::new(),
        });
        let mut preds = Vec::new();
        match meta {
            Meta::Mem { last_writer, last_readers } => match kind {
                EventKind::MemRead => {
                    if let Some(w) = last_writer {
                        preds.push(w.clone());
                    }
                    last_readers.insert(thd, curr.clone());
                }
                EventKind::MemWrite => {
                    if let Some(w) = last_writer {
                        preds.push(w.clone());
                    }
                    preds.extend(last_readers.values().cloned());
                    *last_writer = Some(curr.clone());
                    last_readers.clear();
                }
                _ => {}
            },
            // A sync variable aliased with a memory access; ignore.
            Meta::Mutex { .. } => return,
        }
        preds.retain(|p| p.thd != thd);
        self.process_access(iaddr, curr, preds);
    }

    fn mutex_access(
        &mut self,
        thd: ThreadId,
        clk: Timestamp,
        inst: &Arc<Inst>,
        addr: Address,
        kind: EventKind,
    ) {
        if self.skip_inst(inst) {
            return;
        }
        let uid = self.next_uid();
        let ls = self.curr_ls.entry(thd).or_default().clone();
        let curr = Acc { uid, thd, clk, kind, inst: Arc::clone(inst), ls };

        let meta = self
            .meta_table
            .entry(addr)
            .or_insert_with(|| Meta::Mutex { last_unlocker: None });
        let mut preds = Vec::new();
        match meta {
            Meta::Mutex { last_unlocker } => match kind {
                EventKind::MutexLock => {
                    if let Some(u) = last_unlocker {
                        preds.push(u.clone());
                    }
                }
                EventKind::MutexUnlock => {
                    *last_unlocker = Some(curr.clone());
                }
                _ => {}
            },
            Meta::Mem { .. } => return,
        }
        preds.retain(|p| p.thd != thd);
        self.process_access(addr, curr, preds);
    }

    /// Two accesses inside the same acquisition instance of a common lock
    /// cannot form an adjacent dependency.
    fn pair_schedulable(prev: &Acc, curr: &Acc) -> bool {
        for (addr, version) in prev.ls.iter() {
            if curr.ls.contains_version(addr, version) {
                return false;
            }
        }
        true
    }

    fn process_access(&mut self, addr: Address, curr: Acc, preds: Vec<Acc>) {
        // Record fired instances of already-known idiom-1 iRoots; the
        // observer never invents candidates of its own.
        for pred in &preds {
            if !pred.kind.conflicts_with(curr.kind) || !Self::pair_schedulable(pred, &curr) {
                continue;
            }
            let Some(e0) = self.iroot_db.find_event(&pred.inst, pred.kind) else {
                continue;
            };
            let Some(e1) = self.iroot_db.find_event(&curr.inst, curr.kind) else {
                continue;
            };
            if let Some(iroot) = self.iroot_db.find_iroot(Idiom::Idiom1, &[e0, e1]) {
                debug!("observer: idiom1 fired: {}", iroot.to_display_string());
                self.memo.observed(&iroot, self.shadow);
            }
        }

        if self.complex_idioms {
            self.update_local_info(addr, curr, preds);
        }
    }

    fn update_local_info(&mut self, addr: Address, curr: Acc, preds: Vec<Acc>) {
        // Record this access as a successor of each predecessor.
        for pred in &preds {
            if let Some(li) = self.local_info.get_mut(&pred.thd) {
                if let Some(entries) = li.entries.get_mut(&pred.clk) {
                    if let Some(entry) =
                        entries.iter_mut().find(|e| e.acc.uid == pred.uid)
                    {
                        entry.succs.push(SuccEntry { succ: curr.clone() });
                    }
                }
            }
        }

        // Scan recent local accesses for compound bounds.
        let vw = self.vw;
        let window_start = curr.clk.saturating_sub(vw);
        let mut fired: Vec<(Idiom, [Acc; 4])> = Vec::new();
        {
            let li = self.local_info.entry(curr.thd).or_default();
            for (&prev_clk, entries) in li.entries.range(window_start..curr.clk) {
                if curr.clk - prev_clk >= vw {
                    continue;
                }
                for prev_entry in entries {
                    if prev_entry.acc.uid == curr.uid {
                        continue;
                    }
                    if !lp_valid(prev_entry.acc.kind, curr.kind) {
                        continue;
                    }
                    for se in &prev_entry.succs {
                        for pred in &preds {
                            if se.succ.thd != pred.thd {
                                continue;
                            }
                            if se.succ.uid == pred.uid {
                                // prev → S → curr with one remote access.
                                fired.push((
                                    Idiom::Idiom2,
                                    [
                                        prev_entry.acc.clone(),
                                        se.succ.clone(),
                                        curr.clone(),
                                        curr.clone(),
                                    ],
                                ));
                            } else if se.succ.clk <= pred.clk {
                                let idiom = if prev_entry.addr == addr {
                                    Idiom::Idiom3
                                } else if self.single_var_idioms {
                                    continue;
                                } else {
                                    Idiom::Idiom4
                                };
                                fired.push((
                                    idiom,
                                    [
                                        prev_entry.acc.clone(),
                                        se.succ.clone(),
                                        pred.clone(),
                                        curr.clone(),
                                    ],
                                ));
                            } else if prev_entry.addr != addr && !self.single_var_idioms {
                                // Remote pair fired in reversed order.
                                fired.push((
                                    Idiom::Idiom5,
                                    [
                                        prev_entry.acc.clone(),
                                        se.succ.clone(),
                                        pred.clone(),
                                        curr.clone(),
                                    ],
                                ));
                            }
                        }
                    }
                }
            }

            // Append the current access and drop entries that fell out of
            // every future window.
            li.entries
                .entry(curr.clk)
                .or_default()
                .push(LocalEntry { addr, acc: curr.clone(), succs: Vec::new() });
            let cutoff = curr.clk.saturating_sub(vw);
            while let Some((&oldest, _)) = li.entries.iter().next() {
                if oldest >= cutoff {
                    break;
                }
                li.entries.remove(&oldest);
            }
        }

        for (idiom, accs) in fired {
            self.record_compound(idiom, &accs);
        }
    }

    fn record_compound(&mut self, idiom: Idiom, accs: &[Acc; 4]) {
        let mut events = Vec::with_capacity(idiom.num_events());
        for acc in accs.iter().take(idiom.num_events()) {
            match self.iroot_db.find_event(&acc.inst, acc.kind) {
                Some(e) => events.push(e),
                None => return,
            }
        }
        if let Some(iroot) = self.iroot_db.find_iroot(idiom, &events) {
            debug!("observer: {:?} fired: {}", idiom, iroot.to_display_string());
            self.memo.observed(&iroot, self.shadow);
        }
    }

    fn free_region(&mut self, addr: Address) {
        let size = self.filter.remove(addr);
        if size == 0 {
            return;
        }
        let start = addr & !(self.unit_size - 1);
        let end = (addr + size as Address + self.unit_size - 1) & !(self.unit_size - 1);
        let mut iaddr = start;
        while iaddr < end {
            self.meta_table.remove(&iaddr);
            iaddr += self.unit_size;
        }
        // Drop recent entries over the freed range so they cannot pair.
        for li in self.local_info.values_mut() {
            for entries in li.entries.values_mut() {
                entries.retain(|e| e.addr < start || e.addr >= end);
            }
            li.entries.retain(|_, v| !v.is_empty());
        }
    }
}

impl Analyzer for Observer {
    fn name(&self) -> &'static str {
        "observer"
    }

    fn event(&mut self, event: &Event) {
        match event {
            Event::MemRead { thd, clk, inst, addr, size } => {
                self.mem_access(*thd, *clk, inst, *addr, *size, EventKind::MemRead);
            }
            Event::MemWrite { thd, clk, inst, addr, size } => {
                self.mem_access(*thd, *clk, inst, *addr, *size, EventKind::MemWrite);
            }
            Event::MutexLock { thd, clk, inst, addr } => {
                self.curr_ls.entry(*thd).or_default().add(*addr);
                self.mutex_access(*thd, *clk, inst, *addr, EventKind::MutexLock);
            }
            Event::MutexUnlock { thd, clk, inst, addr } => {
                self.curr_ls.entry(*thd).or_default().remove(*addr);
                self.mutex_access(*thd, *clk, inst, *addr, EventKind::MutexUnlock);
            }
            Event::CondWaitBefore { thd, clk, inst, mutex, .. } => {
                self.curr_ls.entry(*thd).or_default().remove(*mutex);
                self.mutex_access(*thd, *clk, inst, *mutex, EventKind::MutexUnlock);
            }
            Event::CondWaitAfter { thd, clk, inst, mutex, .. } => {
                self.mutex_access(*thd, *clk, inst, *mutex, EventKind::MutexLock);
                self.curr_ls.entry(*thd).or_default().add(*mutex);
            }
            Event::RegionAlloc { addr, size, .. } => {
                self.filter.add(*addr, *size);
            }
            Event::RegionFree { addr, .. } => {
                self.free_region(*addr);
            }
            Event::ThreadExit { thd, .. } => {
                self.local_info.remove(thd);
                self.curr_ls.remove(thd);
            }
            _ => {}
        }
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
        obs: Observer,
        insts: Vec<Arc<Inst>>,
        clks: HashMap<ThreadId, Timestamp>,
    }

    impl Rig {
        fn new(complex: bool) -> Self {
            let reg = StaticRegistry::new();
            let img = reg.intern_image("/usr/bin/app");
            let insts = (0..8).map(|i| reg.intern_inst(&img, 0x100 + i * 4)).collect();
            let db = Arc::new(IrootDb::new());
            let memo = Arc::new(Memo::new(Arc::clone(&db)));
            let opts = Options { complex_idioms: complex, ..Options::default() };
            let obs = Observer::new(&opts, Arc::clone(&db), Arc::clone(&memo));
            let mut rig = Rig { _reg: reg, db, memo, obs, insts, clks: HashMap::new() };
            rig.obs.event(&Event::RegionAlloc { thd: 0, clk: 0, addr: 0x1000, size: 0x1000 });
            rig
        }

        fn clk(&mut self, thd: ThreadId) -> Timestamp {
            let c = self.clks.entry(thd).or_insert(0);
            *c += 1;
            *c
        }

        fn read(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.obs.event(&Event::MemRead {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
                size: 4,
            });
        }

        fn write(&mut self, thd: ThreadId, inst: usize, addr: Address) {
            let clk = self.clk(thd);
            self.obs.event(&Event::MemWrite {
                thd,
                clk,
                inst: self.insts[inst].clone(),
                addr,
                size: 4,
            });
        }
    }

    impl Rig {
        /// Register a known candidate, as a previous prediction run would.
        fn known_iroot(&self, idiom: Idiom, events: &[(usize, EventKind)]) -> Arc<crate::iroot::Iroot> {
            let events: Vec<_> = events
                .iter()
                .map(|&(i, kind)| self.db.get_event(&self.insts[i], kind))
                .collect();
            self.db.get_iroot(idiom, &events)
        }
    }

    #[test]
    fn remote_write_after_read_is_observed() {
        let mut rig = Rig::new(false);
        let iroot = rig.known_iroot(
            Idiom::Idiom1,
            &[(0, EventKind::MemRead), (1, EventKind::MemWrite)],
        );
        rig.read(1, 0, 0x1000);
        rig.write(2, 1, 0x1000);
        assert!(rig.memo.is_exposed(&iroot), "R@T1 -> W@T2 fired");
    }

    #[test]
    fn unknown_pairs_are_not_recorded() {
        let mut rig = Rig::new(false);
        // Nothing in the database: the observer invents no candidates.
        rig.read(1, 0, 0x1000);
        rig.write(2, 1, 0x1000);
        assert_eq!(rig.db.iroot_count(), 0);
    }

    #[test]
    fn local_pairs_are_not_observed() {
        let mut rig = Rig::new(false);
        let iroot = rig.known_iroot(
            Idiom::Idiom1,
            &[(0, EventKind::MemWrite), (1, EventKind::MemRead)],
        );
        rig.write(1, 0, 0x1000);
        rig.read(1, 1, 0x1000);
        assert!(!rig.memo.is_exposed(&iroot));
    }

    #[test]
    fn read_read_does_not_conflict() {
        let mut rig = Rig::new(false);
        let iroot = rig.known_iroot(
            Idiom::Idiom1,
            &[(0, EventKind::MemRead), (1, EventKind::MemRead)],
        );
        rig.read(1, 0, 0x1000);
        rig.read(2, 1, 0x1000);
        assert!(!rig.memo.is_exposed(&iroot));
    }

    #[test]
    fn unlock_lock_is_observed() {
        let mut rig = Rig::new(false);
        let iroot = rig.known_iroot(
            Idiom::Idiom1,
            &[(0, EventKind::MutexUnlock), (1, EventKind::MutexLock)],
        );
        let inst0 = rig.insts[0].clone();
        let inst1 = rig.insts[1].clone();
        rig.obs.event(&Event::MutexLock { thd: 1, clk: 1, inst: inst0.clone(), addr: 0x2000 });
        rig.obs.event(&Event::MutexUnlock { thd: 1, clk: 2, inst: inst0, addr: 0x2000 });
        rig.obs.event(&Event::MutexLock { thd: 2, clk: 1, inst: inst1, addr: 0x2000 });
        assert!(rig.memo.is_exposed(&iroot));
    }

    #[test]
    fn fired_idiom2_is_recognized() {
        let mut rig = Rig::new(true);
        let iroot = rig.known_iroot(
            Idiom::Idiom2,
            &[
                (0, EventKind::MemWrite),
                (1, EventKind::MemWrite),
                (2, EventKind::MemRead),
            ],
        );
        // T1: W(a); T2: W(a); T1: R(a) — a fired idiom-2 instance.
        rig.write(1, 0, 0x1000);
        rig.write(2, 1, 0x1000);
        rig.read(1, 2, 0x1000);
        assert!(rig.memo.is_exposed(&iroot));
    }

    #[test]
    fn freed_region_stops_tracking() {
        let mut rig = Rig::new(false);
        let iroot = rig.known_iroot(
            Idiom::Idiom1,
            &[(0, EventKind::MemRead), (1, EventKind::MemWrite)],
        );
        rig.read(1, 0, 0x1000);
        rig.obs.event(&Event::RegionFree { thd: 1, clk: 10, addr: 0x1000 });
        rig.write(2, 1, 0x1000);
        assert!(!rig.memo.is_exposed(&iroot), "freed region must not pair");
    }

    #[test]
    fn lp_valid_table_shape() {
        use EventKind::*;
        assert!(lp_valid(MemRead, MemWrite));
        assert!(lp_valid(MemWrite, MemRead));
        assert!(lp_valid(MutexLock, MutexLock));
        assert!(!lp_valid(MutexLock, MutexUnlock));
        assert!(lp_valid(MutexUnlock, MutexLock));
    }
}
