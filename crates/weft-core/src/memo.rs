//! Memoization of per-iRoot testing state across runs.
//!
//! The memo tracks which iRoots have been predicted, which are still
//! candidates for active testing, and which have been exposed or have
//! exhausted their testing budget. `choose_for_test` drives the test
//! campaign: simplest idiom first, application code before common
//! libraries, least-tested candidates first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::dbfile;
use crate::iroot::{Idiom, Iroot, IrootDb, IrootId};

/// Per-candidate give-up threshold: a candidate is dropped from the test
/// set after this many unsuccessful tries in one campaign.
pub const DEFAULT_FAILED_LIMIT: u32 = 2;

/// Lifetime give-up threshold: once an iRoot accumulates this many test
/// runs without exposure it joins the failed set for good.
pub const DEFAULT_TOTAL_FAILED_LIMIT: u32 = 6;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct IrootInfo {
    total_test_runs: u32,
    /// Set when either endpoint ran inside an interruptible syscall window;
    /// `None` until first determined.
    async_flag: Option<bool>,
}

#[derive(Default)]
struct MemoState {
    info: HashMap<IrootId, IrootInfo>,
    exposed: HashSet<IrootId>,
    failed: HashSet<IrootId>,
    predicted: HashSet<IrootId>,
    shadow_exposed: HashSet<IrootId>,
    /// Candidate iRoots with their per-campaign test counts.
    candidates: HashMap<IrootId, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoMsg {
    info: Vec<(IrootId, IrootInfo)>,
    exposed: Vec<IrootId>,
    failed: Vec<IrootId>,
    predicted: Vec<IrootId>,
    shadow_exposed: Vec<IrootId>,
    candidates: Vec<(IrootId, u32)>,
}

/// The memoization database.
pub struct Memo {
    iroot_db: Arc<IrootDb>,
    state: Mutex<MemoState>,
    failed_limit: u32,
    total_failed_limit: u32,
}

impl Memo {
    pub fn new(iroot_db: Arc<IrootDb>) -> Self {
        Self::with_limits(iroot_db, DEFAULT_FAILED_LIMIT, DEFAULT_TOTAL_FAILED_LIMIT)
    }

    pub fn with_limits(iroot_db: Arc<IrootDb>, failed_limit: u32, total_failed_limit: u32) -> Self {
        Self {
            iroot_db,
            state: Mutex::new(MemoState::default()),
            failed_limit,
            total_failed_limit,
        }
    }

    /// Choose the next candidate to test, walking idioms simplest first.
    pub fn choose_for_test(&self) -> Option<Arc<Iroot>> {
        Idiom::PRIORITY
            .iter()
            .find_map(|&idiom| self.choose_for_test_idiom(idiom))
    }

    /// Choose the next candidate of one idiom.
    ///
    /// Candidates are scanned in iroot-id order. Application-code
    /// candidates always win over ones touching common libraries; within a
    /// group the least-tested iRoot wins.
    pub fn choose_for_test_idiom(&self, idiom: Idiom) -> Option<Arc<Iroot>> {
        let state = self.state.lock().unwrap();
        let mut by_id: BTreeMap<IrootId, Arc<Iroot>> = BTreeMap::new();
        for &id in state.candidates.keys() {
            if let Some(iroot) = self.iroot_db.find_iroot_by_id(id) {
                if iroot.idiom() == idiom {
                    by_id.insert(id, iroot);
                }
            }
        }

        let pick = |from_app: bool| -> Option<Arc<Iroot>> {
            let mut best: Option<&Arc<Iroot>> = None;
            for iroot in by_id.values() {
                if iroot.has_common_lib_event() == from_app {
                    continue;
                }
                let runs = state.info.get(&iroot.id()).map_or(0, |i| i.total_test_runs);
                match best {
                    None => best = Some(iroot),
                    Some(b) => {
                        let best_runs =
                            state.info.get(&b.id()).map_or(0, |i| i.total_test_runs);
                        if runs < best_runs {
                            best = Some(iroot);
                        }
                    }
                }
            }
            best.cloned()
        };

        pick(true).or_else(|| pick(false))
    }

    /// Look up a specific iRoot by id (the `target_iroot` knob).
    pub fn choose_by_id(&self, id: IrootId) -> Option<Arc<Iroot>> {
        self.iroot_db.find_iroot_by_id(id)
    }

    /// Record a successful active test: the iRoot was exposed.
    pub fn test_success(&self, iroot: &Iroot) {
        let mut state = self.state.lock().unwrap();
        *state.candidates.entry(iroot.id()).or_insert(0) += 1;
        state.info.entry(iroot.id()).or_default().total_test_runs += 1;
        state.exposed.insert(iroot.id());
        debug!("memo: iroot {} exposed", iroot.id());
    }

    /// Record a failed active test. Once the lifetime budget is spent the
    /// iRoot joins the failed set permanently.
    pub fn test_fail(&self, iroot: &Iroot) {
        let mut state = self.state.lock().unwrap();
        *state.candidates.entry(iroot.id()).or_insert(0) += 1;
        let info = state.info.entry(iroot.id()).or_default();
        info.total_test_runs += 1;
        if info.total_test_runs >= self.total_failed_limit {
            state.failed.insert(iroot.id());
            debug!("memo: iroot {} reached total failed limit", iroot.id());
        }
    }

    /// Record a prediction. Newly predicted iRoots join the candidate set
    /// with a fresh per-campaign counter.
    pub fn predicted(&self, iroot: &Iroot) {
        let mut state = self.state.lock().unwrap();
        if state.predicted.insert(iroot.id()) {
            state.info.entry(iroot.id()).or_default();
            state.candidates.entry(iroot.id()).or_insert(0);
        }
    }

    /// Record that a known iRoot fired during a passive run.
    pub fn observed(&self, iroot: &Iroot, shadow: bool) {
        let mut state = self.state.lock().unwrap();
        state.info.entry(iroot.id()).or_default();
        if shadow {
            state.shadow_exposed.insert(iroot.id());
        } else {
            state.exposed.insert(iroot.id());
        }
    }

    pub fn total_test_runs(&self, iroot: &Iroot) -> u32 {
        let state = self.state.lock().unwrap();
        state.info.get(&iroot.id()).map_or(0, |i| i.total_test_runs)
    }

    pub fn is_async(&self, iroot: &Iroot) -> bool {
        let state = self.state.lock().unwrap();
        state
            .info
            .get(&iroot.id())
            .and_then(|i| i.async_flag)
            .unwrap_or(false)
    }

    pub fn set_async(&self, iroot: &Iroot) {
        let mut state = self.state.lock().unwrap();
        state.info.entry(iroot.id()).or_default().async_flag = Some(true);
    }

    pub fn total_candidates(&self) -> usize {
        self.state.lock().unwrap().candidates.len()
    }

    pub fn total_predicted(&self) -> usize {
        self.state.lock().unwrap().predicted.len()
    }

    /// Ids of every predicted iRoot, in ascending order. This is what a
    /// single-run delta list persists.
    pub fn predicted_ids(&self) -> Vec<IrootId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<IrootId> = state.predicted.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_exposed(&self, iroot: &Iroot) -> bool {
        self.state.lock().unwrap().exposed.contains(&iroot.id())
    }

    pub fn is_failed(&self, iroot: &Iroot) -> bool {
        self.state.lock().unwrap().failed.contains(&iroot.id())
    }

    pub fn is_candidate(&self, iroot: &Iroot) -> bool {
        self.state.lock().unwrap().candidates.contains_key(&iroot.id())
    }

    /// Exposed iRoots of one idiom, optionally counting shadow exposures.
    pub fn total_exposed(&self, idiom: Idiom, shadow: bool) -> usize {
        let state = self.state.lock().unwrap();
        let mut seen: HashSet<IrootId> = HashSet::new();
        for &id in state
            .exposed
            .iter()
            .chain(shadow.then_some(&state.shadow_exposed).into_iter().flatten())
        {
            if let Some(iroot) = self.iroot_db.find_iroot_by_id(id) {
                if iroot.idiom() == idiom {
                    seen.insert(id);
                }
            }
        }
        seen.len()
    }

    /// Commutative union with another memo over the same iRoot database:
    /// test-run counters take the maximum, async flags OR together, the
    /// sets union, candidate counters take the maximum.
    pub fn merge(&self, other: &Memo) {
        let other_state = other.state.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        for (&id, other_info) in &other_state.info {
            let info = state.info.entry(id).or_default();
            info.total_test_runs = info.total_test_runs.max(other_info.total_test_runs);
            if other_info.async_flag == Some(true) {
                info.async_flag = Some(true);
            }
        }
        state.exposed.extend(&other_state.exposed);
        state.failed.extend(&other_state.failed);
        state.predicted.extend(&other_state.predicted);
        state.shadow_exposed.extend(&other_state.shadow_exposed);
        for (&id, &count) in &other_state.candidates {
            let slot = state.candidates.entry(id).or_insert(0);
            *slot = (*slot).max(count);
        }
    }

    /// Drop candidates that are exhausted or already answered: per-campaign
    /// counters at the failed limit, exposed iRoots, and (optionally)
    /// permanently failed iRoots.
    pub fn refine_candidates(&self, drop_failed: bool) {
        let mut state = self.state.lock().unwrap();
        let failed_limit = self.failed_limit;
        let MemoState {
            candidates,
            exposed,
            failed,
            ..
        } = &mut *state;
        candidates.retain(|id, count| {
            if *count >= failed_limit {
                return false;
            }
            if exposed.contains(id) {
                return false;
            }
            if drop_failed && failed.contains(id) {
                return false;
            }
            true
        });
    }

    /// Keep at most `num` uniformly chosen candidates of one idiom.
    pub fn sample_candidates<R: rand::Rng>(&self, idiom: Idiom, num: usize, rng: &mut R) {
        let mut state = self.state.lock().unwrap();
        let mut matching: Vec<IrootId> = state
            .candidates
            .keys()
            .copied()
            .filter(|&id| {
                self.iroot_db
                    .find_iroot_by_id(id)
                    .is_some_and(|r| r.idiom() == idiom)
            })
            .collect();
        matching.sort_unstable();
        matching.shuffle(rng);
        for &id in matching.iter().skip(num) {
            state.candidates.remove(&id);
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let mut msg = MemoMsg {
            info: state.info.iter().map(|(&id, &info)| (id, info)).collect(),
            exposed: state.exposed.iter().copied().collect(),
            failed: state.failed.iter().copied().collect(),
            predicted: state.predicted.iter().copied().collect(),
            shadow_exposed: state.shadow_exposed.iter().copied().collect(),
            candidates: state.candidates.iter().map(|(&id, &c)| (id, c)).collect(),
        };
        msg.info.sort_by_key(|&(id, _)| id);
        msg.exposed.sort_unstable();
        msg.failed.sort_unstable();
        msg.predicted.sort_unstable();
        msg.shadow_exposed.sort_unstable();
        msg.candidates.sort_by_key(|&(id, _)| id);
        dbfile::save_message(path, &msg)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let msg: MemoMsg = dbfile::load_message(path)?;
        let mut state = self.state.lock().unwrap();
        for (id, info) in msg.info {
            state.info.insert(id, info);
        }
        state.exposed.extend(msg.exposed);
        state.failed.extend(msg.failed);
        state.predicted.extend(msg.predicted);
        state.shadow_exposed.extend(msg.shadow_exposed);
        for (id, count) in msg.candidates {
            state.candidates.insert(id, count);
        }
        Ok(())
    }
}
