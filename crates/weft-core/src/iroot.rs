//! iRoots and the iRoot database.
//!
//! An *iRoot event* is a static instruction paired with an access kind; an
//! *iRoot* is an idiom shape over an ordered list of events. Both are
//! interned in the database, which is hash-indexed with collision-tolerant
//! bucket scans and persisted across runs.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dbfile;
use crate::registry::{Inst, InstId, StaticRegistry};

pub type IrootEventId = u32;
pub type IrootId = u32;

/// The kind of an iRoot event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    MemRead,
    MemWrite,
    MutexLock,
    MutexUnlock,
}

impl EventKind {
    pub fn is_mem(self) -> bool {
        matches!(self, EventKind::MemRead | EventKind::MemWrite)
    }

    pub fn is_sync(self) -> bool {
        matches!(self, EventKind::MutexLock | EventKind::MutexUnlock)
    }

    /// Whether `self → dst` is a conflicting inter-thread dependency:
    /// read/write in either order, write/write, or unlock-then-lock.
    pub fn conflicts_with(self, dst: EventKind) -> bool {
        use EventKind::*;
        matches!(
            (self, dst),
            (MemRead, MemWrite) | (MemWrite, MemRead) | (MemWrite, MemWrite)
                | (MutexUnlock, MutexLock)
        )
    }

    fn weak_hash(self) -> u64 {
        self as u64
    }
}

/// The five idiom shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Idiom {
    /// One dependency `A → B` between two threads.
    Idiom1,
    /// `A; (remote C); B` with A and B in one thread.
    Idiom2,
    /// Two nested dependencies over the same location.
    Idiom3,
    /// Two nested dependencies over two locations.
    Idiom4,
    /// Two dependencies with reversed timing — the deadlock shape.
    Idiom5,
}

impl Idiom {
    /// Number of events an iRoot of this idiom carries.
    pub fn num_events(self) -> usize {
        match self {
            Idiom::Idiom1 => 2,
            Idiom::Idiom2 => 3,
            Idiom::Idiom3 | Idiom::Idiom4 | Idiom::Idiom5 => 4,
        }
    }

    /// Testing priority order, simplest shape first.
    pub const PRIORITY: [Idiom; 5] = [
        Idiom::Idiom1,
        Idiom::Idiom2,
        Idiom::Idiom3,
        Idiom::Idiom4,
        Idiom::Idiom5,
    ];
}

/// An interned (instruction, kind) pair.
#[derive(Debug)]
pub struct IrootEvent {
    id: IrootEventId,
    inst: Arc<Inst>,
    kind: EventKind,
}

impl IrootEvent {
    pub fn id(&self) -> IrootEventId {
        self.id
    }

    pub fn inst(&self) -> &Arc<Inst> {
        &self.inst
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_mem(&self) -> bool {
        self.kind.is_mem()
    }

    pub fn is_sync(&self) -> bool {
        self.kind.is_sync()
    }
}

/// Minimum observed per-endpoint access counts for an idiom-1 memory pair:
/// how many earlier same-thread accesses to the location preceded the
/// source and destination. Merged across runs by pointwise minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountPair {
    pub src_count: u32,
    pub dst_count: u32,
}

/// An interned idiom instance over an ordered event list.
///
/// For idioms 3–5, events at positions 0 and 1 form the outer dependency
/// and positions 2 and 3 the inner one.
#[derive(Debug)]
pub struct Iroot {
    id: IrootId,
    idiom: Idiom,
    events: Vec<Arc<IrootEvent>>,
    count_pair: Mutex<Option<CountPair>>,
}

impl Iroot {
    pub fn id(&self) -> IrootId {
        self.id
    }

    pub fn idiom(&self) -> Idiom {
        self.idiom
    }

    pub fn events(&self) -> &[Arc<IrootEvent>] {
        &self.events
    }

    pub fn event(&self, index: usize) -> &Arc<IrootEvent> {
        &self.events[index]
    }

    pub fn has_mem(&self) -> bool {
        self.events.iter().any(|e| e.is_mem())
    }

    pub fn has_sync(&self) -> bool {
        self.events.iter().any(|e| e.is_sync())
    }

    /// Whether any event lives in a common system library.
    pub fn has_common_lib_event(&self) -> bool {
        self.events.iter().any(|e| e.inst().image().is_common_lib())
    }

    pub fn count_pair(&self) -> Option<CountPair> {
        *self.count_pair.lock().unwrap()
    }

    /// Merge in a newly observed count pair, keeping the pointwise minimum
    /// across observations.
    pub fn merge_count_pair(&self, counts: CountPair) {
        let mut slot = self.count_pair.lock().unwrap();
        *slot = Some(match *slot {
            None => counts,
            Some(old) => CountPair {
                src_count: old.src_count.min(counts.src_count),
                dst_count: old.dst_count.min(counts.dst_count),
            },
        });
    }

    pub fn to_display_string(&self) -> String {
        let events: Vec<String> = self
            .events
            .iter()
            .map(|e| format!("{:?}@{}", e.kind(), e.inst().to_display_string()))
            .collect();
        format!("iroot {} {:?} [{}]", self.id, self.idiom, events.join(", "))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EventMsg {
    id: IrootEventId,
    inst_id: InstId,
    kind: EventKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct IrootMsg {
    id: IrootId,
    idiom: Idiom,
    event_ids: Vec<IrootEventId>,
    count_pair: Option<CountPair>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IrootDbMsg {
    events: Vec<EventMsg>,
    iroots: Vec<IrootMsg>,
}

#[derive(Default)]
struct DbState {
    curr_event_id: IrootEventId,
    curr_iroot_id: IrootId,
    events_by_id: HashMap<IrootEventId, Arc<IrootEvent>>,
    iroots_by_id: HashMap<IrootId, Arc<Iroot>>,
    event_index: HashMap<u64, Vec<Arc<IrootEvent>>>,
    iroot_index: HashMap<u64, Vec<Arc<Iroot>>>,
}

impl DbState {
    fn hash_event(inst: &Arc<Inst>, kind: EventKind) -> u64 {
        (inst.id() as u64).wrapping_add(kind.weak_hash())
    }

    fn hash_iroot(idiom: Idiom, events: &[Arc<IrootEvent>]) -> u64 {
        events
            .iter()
            .fold(idiom as u64, |h, e| h.wrapping_add(e.id() as u64))
    }

    fn find_event(&self, inst: &Arc<Inst>, kind: EventKind) -> Option<Arc<IrootEvent>> {
        let bucket = self.event_index.get(&Self::hash_event(inst, kind))?;
        bucket
            .iter()
            .find(|e| e.inst().id() == inst.id() && e.kind() == kind)
            .cloned()
    }

    fn find_iroot(&self, idiom: Idiom, events: &[Arc<IrootEvent>]) -> Option<Arc<Iroot>> {
        let bucket = self.iroot_index.get(&Self::hash_iroot(idiom, events))?;
        bucket
            .iter()
            .find(|r| {
                r.idiom() == idiom
                    && r.events().len() == events.len()
                    && r.events()
                        .iter()
                        .zip(events)
                        .all(|(a, b)| a.id() == b.id())
            })
            .cloned()
    }

    fn insert_event(&mut self, event: Arc<IrootEvent>) {
        let hash = Self::hash_event(event.inst(), event.kind());
        self.event_index.entry(hash).or_default().push(Arc::clone(&event));
        self.events_by_id.insert(event.id(), event);
    }

    fn insert_iroot(&mut self, iroot: Arc<Iroot>) {
        let hash = Self::hash_iroot(iroot.idiom(), iroot.events());
        self.iroot_index.entry(hash).or_default().push(Arc::clone(&iroot));
        self.iroots_by_id.insert(iroot.id(), iroot);
    }
}

/// The canonical, persistent store of iRoot events and iRoots.
pub struct IrootDb {
    state: Mutex<DbState>,
}

impl Default for IrootDb {
    fn default() -> Self {
        Self::new()
    }
}

impl IrootDb {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DbState::default()),
        }
    }

    /// Return the canonical event for `(inst, kind)`, creating it if absent.
    pub fn get_event(&self, inst: &Arc<Inst>, kind: EventKind) -> Arc<IrootEvent> {
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state.find_event(inst, kind) {
            return event;
        }
        state.curr_event_id += 1;
        let event = Arc::new(IrootEvent {
            id: state.curr_event_id,
            inst: Arc::clone(inst),
            kind,
        });
        state.insert_event(Arc::clone(&event));
        event
    }

    /// Return the canonical iRoot for `(idiom, events)`, creating it if
    /// absent. The event count must match the idiom shape.
    pub fn get_iroot(&self, idiom: Idiom, events: &[Arc<IrootEvent>]) -> Arc<Iroot> {
        assert_eq!(events.len(), idiom.num_events(), "wrong event count for {idiom:?}");
        let mut state = self.state.lock().unwrap();
        if let Some(iroot) = state.find_iroot(idiom, events) {
            return iroot;
        }
        state.curr_iroot_id += 1;
        let iroot = Arc::new(Iroot {
            id: state.curr_iroot_id,
            idiom,
            events: events.to_vec(),
            count_pair: Mutex::new(None),
        });
        state.insert_iroot(Arc::clone(&iroot));
        iroot
    }

    /// Look up the canonical event without creating it.
    pub fn find_event(&self, inst: &Arc<Inst>, kind: EventKind) -> Option<Arc<IrootEvent>> {
        self.state.lock().unwrap().find_event(inst, kind)
    }

    /// Look up the canonical iRoot without creating it.
    pub fn find_iroot(&self, idiom: Idiom, events: &[Arc<IrootEvent>]) -> Option<Arc<Iroot>> {
        self.state.lock().unwrap().find_iroot(idiom, events)
    }

    pub fn find_event_by_id(&self, id: IrootEventId) -> Option<Arc<IrootEvent>> {
        self.state.lock().unwrap().events_by_id.get(&id).cloned()
    }

    pub fn find_iroot_by_id(&self, id: IrootId) -> Option<Arc<Iroot>> {
        self.state.lock().unwrap().iroots_by_id.get(&id).cloned()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events_by_id.len()
    }

    pub fn iroot_count(&self) -> usize {
        self.state.lock().unwrap().iroots_by_id.len()
    }

    /// Every iRoot in id order.
    pub fn iroots(&self) -> Vec<Arc<Iroot>> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<_> = state.iroots_by_id.values().cloned().collect();
        all.sort_by_key(|r| r.id());
        all
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let mut msg = IrootDbMsg::default();
        let mut events: Vec<_> = state.events_by_id.values().collect();
        events.sort_by_key(|e| e.id());
        for event in events {
            msg.events.push(EventMsg {
                id: event.id(),
                inst_id: event.inst().id(),
                kind: event.kind(),
            });
        }
        let mut iroots: Vec<_> = state.iroots_by_id.values().collect();
        iroots.sort_by_key(|r| r.id());
        for iroot in iroots {
            msg.iroots.push(IrootMsg {
                id: iroot.id(),
                idiom: iroot.idiom(),
                event_ids: iroot.events().iter().map(|e| e.id()).collect(),
                count_pair: iroot.count_pair(),
            });
        }
        dbfile::save_message(path, &msg)
    }

    /// Load a database saved by [`save`](Self::save). Instructions are
    /// resolved through `registry`; the id counters advance past the
    /// maximum ids seen.
    pub fn load(&self, path: &Path, registry: &StaticRegistry) -> io::Result<()> {
        let msg: IrootDbMsg = dbfile::load_message(path)?;
        let mut state = self.state.lock().unwrap();
        for event_msg in msg.events {
            let inst = registry.find_inst(event_msg.inst_id).ok_or_else(|| {
                io::Error::other(format!(
                    "iroot event {} references unknown instruction {}",
                    event_msg.id, event_msg.inst_id
                ))
            })?;
            let event = Arc::new(IrootEvent {
                id: event_msg.id,
                inst,
                kind: event_msg.kind,
            });
            state.curr_event_id = state.curr_event_id.max(event_msg.id);
            state.insert_event(event);
        }
        for iroot_msg in msg.iroots {
            let mut events = Vec::with_capacity(iroot_msg.event_ids.len());
            for event_id in &iroot_msg.event_ids {
                let event = state.events_by_id.get(event_id).cloned().ok_or_else(|| {
                    io::Error::other(format!(
                        "iroot {} references unknown event {}",
                        iroot_msg.id, event_id
                    ))
                })?;
                events.push(event);
            }
            let iroot = Arc::new(Iroot {
                id: iroot_msg.id,
                idiom: iroot_msg.idiom,
                events,
                count_pair: Mutex::new(iroot_msg.count_pair),
            });
            state.curr_iroot_id = state.curr_iroot_id.max(iroot_msg.id);
            state.insert_iroot(iroot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (StaticRegistry, Vec<Arc<Inst>>) {
        let reg = StaticRegistry::new();
        let img = reg.intern_image("/usr/bin/app");
        let insts = (0..4).map(|i| reg.intern_inst(&img, 0x100 + i * 4)).collect();
        (reg, insts)
    }

    #[test]
    fn conflict_table() {
        use EventKind::*;
        assert!(MemRead.conflicts_with(MemWrite));
        assert!(MemWrite.conflicts_with(MemRead));
        assert!(MemWrite.conflicts_with(MemWrite));
        assert!(MutexUnlock.conflicts_with(MutexLock));
        assert!(!MemRead.conflicts_with(MemRead));
        assert!(!MutexLock.conflicts_with(MutexUnlock));
        assert!(!MemRead.conflicts_with(MutexLock));
    }

    #[test]
    fn idiom_event_counts() {
        assert_eq!(Idiom::Idiom1.num_events(), 2);
        assert_eq!(Idiom::Idiom2.num_events(), 3);
        assert_eq!(Idiom::Idiom3.num_events(), 4);
        assert_eq!(Idiom::Idiom4.num_events(), 4);
        assert_eq!(Idiom::Idiom5.num_events(), 4);
    }

    #[test]
    fn events_are_interned() {
        let (_reg, insts) = test_registry();
        let db = IrootDb::new();
        let a = db.get_event(&insts[0], EventKind::MemRead);
        let b = db.get_event(&insts[0], EventKind::MemRead);
        assert!(Arc::ptr_eq(&a, &b));
        let c = db.get_event(&insts[0], EventKind::MemWrite);
        assert_ne!(a.id(), c.id());
        assert_eq!(db.event_count(), 2);
    }

    #[test]
    fn iroots_are_interned_by_idiom_and_sequence() {
        let (_reg, insts) = test_registry();
        let db = IrootDb::new();
        let e0 = db.get_event(&insts[0], EventKind::MemRead);
        let e1 = db.get_event(&insts[1], EventKind::MemWrite);

        let a = db.get_iroot(Idiom::Idiom1, &[e0.clone(), e1.clone()]);
        let b = db.get_iroot(Idiom::Idiom1, &[e0.clone(), e1.clone()]);
        assert!(Arc::ptr_eq(&a, &b));

        // Reversed order is a different iRoot even though the hash matches.
        let c = db.get_iroot(Idiom::Idiom1, &[e1, e0]);
        assert_ne!(a.id(), c.id());
        assert_eq!(db.iroot_count(), 2);
    }

    #[test]
    #[should_panic(expected = "wrong event count")]
    fn wrong_event_count_panics() {
        let (_reg, insts) = test_registry();
        let db = IrootDb::new();
        let e0 = db.get_event(&insts[0], EventKind::MemRead);
        db.get_iroot(Idiom::Idiom2, &[e0]);
    }

    #[test]
    fn count_pair_merges_by_minimum() {
        let (_reg, insts) = test_registry();
        let db = IrootDb::new();
        let e0 = db.get_event(&insts[0], EventKind::MemRead);
        let e1 = db.get_event(&insts[1], EventKind::MemWrite);
        let iroot = db.get_iroot(Idiom::Idiom1, &[e0, e1]);

        iroot.merge_count_pair(CountPair { src_count: 3, dst_count: 5 });
        iroot.merge_count_pair(CountPair { src_count: 4, dst_count: 2 });
        assert_eq!(
            iroot.count_pair(),
            Some(CountPair { src_count: 3, dst_count: 2 })
        );
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sinfo_path = dir.path().join("sinfo.db");
        let iroot_path = dir.path().join("iroot.db");

        let (reg, insts) = test_registry();
        let db = IrootDb::new();
        let e0 = db.get_event(&insts[0], EventKind::MemRead);
        let e1 = db.get_event(&insts[1], EventKind::MemWrite);
        let e2 = db.get_event(&insts[2], EventKind::MutexLock);
        let i1 = db.get_iroot(Idiom::Idiom1, &[e0.clone(), e1.clone()]);
        i1.merge_count_pair(CountPair { src_count: 1, dst_count: 2 });
        let _i2 = db.get_iroot(Idiom::Idiom2, &[e0.clone(), e1.clone(), e2]);

        reg.save(&sinfo_path).unwrap();
        db.save(&iroot_path).unwrap();

        let reg2 = StaticRegistry::new();
        reg2.load(&sinfo_path).unwrap();
        let db2 = IrootDb::new();
        db2.load(&iroot_path, &reg2).unwrap();

        assert_eq!(db2.event_count(), 3);
        assert_eq!(db2.iroot_count(), 2);
        let back = db2.find_iroot_by_id(i1.id()).unwrap();
        assert_eq!(back.idiom(), Idiom::Idiom1);
        assert_eq!(back.event(0).kind(), EventKind::MemRead);
        assert_eq!(
            back.count_pair(),
            Some(CountPair { src_count: 1, dst_count: 2 })
        );

        // Re-interning after a load must return the loaded instance.
        let e0_again = db2.get_event(back.event(0).inst(), EventKind::MemRead);
        assert!(Arc::ptr_eq(&e0_again, back.event(0)));
        let i1_again = db2.get_iroot(
            Idiom::Idiom1,
            &[back.event(0).clone(), back.event(1).clone()],
        );
        assert!(Arc::ptr_eq(&i1_again, &back));
    }

    #[test]
    fn load_advances_id_counters() {
        let dir = tempfile::tempdir().unwrap();
        let sinfo_path = dir.path().join("sinfo.db");
        let iroot_path = dir.path().join("iroot.db");

        let (reg, insts) = test_registry();
        let db = IrootDb::new();
        let e0 = db.get_event(&insts[0], EventKind::MemRead);
        let e1 = db.get_event(&insts[1], EventKind::MemWrite);
        let old = db.get_iroot(Idiom::Idiom1, &[e0, e1]);
        reg.save(&sinfo_path).unwrap();
        db.save(&iroot_path).unwrap();

        let reg2 = StaticRegistry::new();
        reg2.load(&sinfo_path).unwrap();
        let db2 = IrootDb::new();
        db2.load(&iroot_path, &reg2).unwrap();

        let inst = reg2.find_inst(insts[2].id()).unwrap();
        let e_new = db2.get_event(&inst, EventKind::MutexUnlock);
        assert!(e_new.id() > 2);
        let old_loaded = db2.find_iroot_by_id(old.id()).unwrap();
        let r_new = db2.get_iroot(
            Idiom::Idiom1,
            &[e_new, old_loaded.event(0).clone()],
        );
        assert!(r_new.id() > old.id());
    }
}
