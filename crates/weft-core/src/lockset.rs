//! Lock sets with global lock versions, and flagged lock sets.
//!
//! Every acquisition of a lock receives a fresh version from a process-wide
//! counter, so two lock sets holding the same address can be told apart by
//! critical-section *instance*: versions match only when both accesses
//! happened inside the same acquisition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::Address;

/// Version tag identifying one acquisition of one lock.
pub type LockVersion = u64;

static CURR_LOCK_VERSION: AtomicU64 = AtomicU64::new(0);

fn next_lock_version() -> LockVersion {
    CURR_LOCK_VERSION.fetch_add(1, Ordering::Relaxed) + 1
}

/// The set of locks a thread currently holds, with per-acquisition versions.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    held: BTreeMap<Address, LockVersion>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Record an acquisition of `addr`, allocating a fresh global version.
    /// Re-adding an already-held lock also allocates a new version.
    pub fn add(&mut self, addr: Address) {
        self.held.insert(addr, next_lock_version());
    }

    /// Drop `addr` from the set. Removing an absent lock is a no-op.
    pub fn remove(&mut self, addr: Address) {
        self.held.remove(&addr);
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.held.contains_key(&addr)
    }

    /// True iff `addr` is held with exactly this version — i.e. the same
    /// critical-section instance.
    pub fn contains_version(&self, addr: Address, version: LockVersion) -> bool {
        self.held.get(&addr) == Some(&version)
    }

    pub fn version(&self, addr: Address) -> Option<LockVersion> {
        self.held.get(&addr).copied()
    }

    /// Same set of lock addresses, versions ignored. Used for local scope
    /// comparisons within one thread.
    pub fn matches(&self, other: &LockSet) -> bool {
        self.held.len() == other.held.len()
            && self.held.keys().all(|addr| other.held.contains_key(addr))
    }

    /// No common lock address at all.
    pub fn disjoint(&self, other: &LockSet) -> bool {
        self.held.keys().all(|addr| !other.held.contains_key(addr))
    }

    /// Check two *remote* lock sets against this one: for every lock this
    /// set holds, the remotes must not share the same acquisition instance
    /// of it (same address and same version in both remotes means the two
    /// remote accesses sat inside one critical section and cannot be
    /// separated).
    pub fn disjoint_remote_pair(&self, rmt1: &LockSet, rmt2: &LockSet) -> bool {
        for (&addr, _) in &self.held {
            if let (Some(v1), Some(v2)) = (rmt1.version(addr), rmt2.version(addr)) {
                if v1 == v2 {
                    return false;
                }
            }
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, LockVersion)> + '_ {
        self.held.iter().map(|(&a, &v)| (a, v))
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (addr, _)) in self.held.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{addr:#x}")?;
        }
        write!(f, "]")
    }
}

/// Per-lock first/last flags for one access.
///
/// `first` marks that the access was the earliest event observed inside
/// that acquisition of the lock, `last` that it was the latest. A remote
/// dependency through a common lock is only schedulable when the source
/// access is the last of its critical section and the destination access
/// is the first of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockFlags {
    pub first: bool,
    pub last: bool,
}

/// Flagged lock set: the common-lock table attached to an access summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlaggedLockSet {
    table: BTreeMap<Address, LockFlags>,
}

impl FlaggedLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Mark locks newly acquired since the previous access: any lock in
    /// `curr_ls` whose acquisition instance was not yet held at `last_ls`
    /// gets its `first` flag, and its `last` flag reset.
    pub fn update_first(&mut self, last_ls: Option<&LockSet>, curr_ls: &LockSet) {
        for (addr, version) in curr_ls.iter() {
            let flags = self.table.entry(addr).or_default();
            let held_before = last_ls.is_some_and(|ls| ls.contains_version(addr, version));
            if !held_before {
                flags.first = true;
            }
            flags.last = false;
        }
    }

    /// Mark locks released since this access: any lock held at `last_ls`
    /// whose acquisition instance is gone from `curr_ls` gets `last`.
    pub fn update_last(&mut self, last_ls: &LockSet, curr_ls: Option<&LockSet>) {
        for (addr, version) in last_ls.iter() {
            let still_held = curr_ls.is_some_and(|ls| ls.contains_version(addr, version));
            if !still_held {
                self.table.entry(addr).or_default().last = true;
            }
        }
    }

    /// Build the table of locks held, with matching versions, at both ends
    /// of a local pair. Flags start cleared.
    pub fn common_of(prev_ls: &LockSet, curr_ls: &LockSet) -> Self {
        let mut fls = Self::new();
        for (addr, version) in prev_ls.iter() {
            if curr_ls.contains_version(addr, version) {
                fls.table.insert(addr, LockFlags::default());
            }
        }
        fls
    }

    /// Mutual-exclusion check for a remote dependency `self → dst`: every
    /// common lock address requires self to be the last access in its
    /// critical section and dst the first in its own.
    pub fn excludes(&self, dst: &FlaggedLockSet) -> bool {
        for (addr, src_flags) in &self.table {
            if let Some(dst_flags) = dst.table.get(addr) {
                if !src_flags.last || !dst_flags.first {
                    return false;
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Collision-tolerant hash over addresses and flags.
    pub fn weak_hash(&self) -> u64 {
        self.table.iter().fold(0u64, |h, (&addr, flags)| {
            h.wrapping_add(addr)
                .wrapping_add(flags.first as u64)
                .wrapping_add(flags.last as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_allocates_fresh_versions() {
        let mut ls = LockSet::new();
        ls.add(0x10);
        let v1 = ls.version(0x10).unwrap();
        ls.add(0x10);
        let v2 = ls.version(0x10).unwrap();
        assert_ne!(v1, v2, "re-adding must produce a new version");
    }

    #[test]
    fn remove_is_idempotent() {
        let mut ls = LockSet::new();
        ls.add(0x10);
        ls.remove(0x10);
        assert!(!ls.contains(0x10));
        ls.remove(0x10);
        assert!(!ls.contains(0x10));
    }

    #[test]
    fn contains_version_requires_same_instance() {
        let mut ls = LockSet::new();
        ls.add(0x10);
        let v = ls.version(0x10).unwrap();
        assert!(ls.contains_version(0x10, v));
        assert!(!ls.contains_version(0x10, v + 1));
        ls.remove(0x10);
        assert!(!ls.contains_version(0x10, v));
    }

    #[test]
    fn matches_ignores_versions() {
        let mut a = LockSet::new();
        a.add(0x10);
        let mut b = LockSet::new();
        b.add(0x10);
        assert!(a.matches(&b));
        b.add(0x20);
        assert!(!a.matches(&b));
    }

    #[test]
    fn disjoint_remote_pair_rejects_shared_instance() {
        let mut holder = LockSet::new();
        holder.add(0x10);
        // Both remote sets captured the same acquisition of 0x10.
        let mut rmt = LockSet::new();
        rmt.add(0x10);
        let same = rmt.clone();
        assert!(!holder.disjoint_remote_pair(&rmt, &same));
        // Distinct acquisitions are fine.
        let mut rmt2 = LockSet::new();
        rmt2.add(0x10);
        assert!(holder.disjoint_remote_pair(&rmt, &rmt2));
    }

    #[test]
    fn first_last_flags_follow_critical_section() {
        let mut ls = LockSet::new();
        ls.add(0x10);

        // First access inside the critical section.
        let mut fls = FlaggedLockSet::new();
        fls.update_first(None, &ls);

        // The lock is released before the next access.
        let mut after = ls.clone();
        after.remove(0x10);
        fls.update_last(&ls, Some(&after));

        let flags = fls.table[&0x10];
        assert!(flags.first && flags.last);
    }

    #[test]
    fn exclusion_requires_last_then_first() {
        let mut src = FlaggedLockSet::new();
        src.table.insert(0x10, LockFlags { first: true, last: true });
        let mut dst = FlaggedLockSet::new();
        dst.table.insert(0x10, LockFlags { first: true, last: false });
        assert!(src.excludes(&dst));

        let mut mid = FlaggedLockSet::new();
        mid.table.insert(0x10, LockFlags { first: false, last: false });
        assert!(!mid.excludes(&dst), "source not last in its section");
        assert!(!src.excludes(&mid), "destination not first in its section");
    }

    #[test]
    fn exclusion_ignores_uncommon_locks() {
        let mut src = FlaggedLockSet::new();
        src.table.insert(0x10, LockFlags { first: false, last: false });
        let dst = FlaggedLockSet::new();
        assert!(src.excludes(&dst));
    }
}
