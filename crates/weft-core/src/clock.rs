//! Sparse vector clocks for happens-before reasoning.
//!
//! Each thread carries a logical clock; a vector clock maps thread ids to
//! the latest tick observed from that thread. Joins happen at fork/join,
//! cond-var signal delivery, and barrier exchange.

use std::collections::BTreeMap;
use std::fmt;

use crate::event::{ThreadId, Timestamp};

/// Sparse mapping from thread id to logical tick.
///
/// Absent entries count as zero. `happens_before` is the strict partial
/// order: every component ≤ and at least one component <.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    ticks: BTreeMap<ThreadId, Timestamp>,
}

impl VectorClock {
    /// An empty clock (all components zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// The tick recorded for `thd` (zero if absent).
    pub fn get(&self, thd: ThreadId) -> Timestamp {
        self.ticks.get(&thd).copied().unwrap_or(0)
    }

    /// Advance this thread's own component by one.
    pub fn increment(&mut self, thd: ThreadId) {
        *self.ticks.entry(thd).or_insert(0) += 1;
    }

    /// Pointwise maximum with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        for (&thd, &tick) in &other.ticks {
            let slot = self.ticks.entry(thd).or_insert(0);
            if *slot < tick {
                *slot = tick;
            }
        }
    }

    /// Strict happens-before: self ≤ other pointwise and self ≠ other.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for (&thd, &tick) in &self.ticks {
            let theirs = other.get(thd);
            if tick > theirs {
                return false;
            }
            if tick < theirs {
                strictly_less = true;
            }
        }
        for (&thd, &tick) in &other.ticks {
            if tick > self.get(thd) {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither clock happens before the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self) && self != other
    }

    /// Iterate over the non-zero components.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, Timestamp)> + '_ {
        self.ticks.iter().map(|(&t, &c)| (t, c))
    }

    /// Sum of components and ids, used by hash indexes that tolerate
    /// collisions with a bucket scan.
    pub fn weak_hash(&self) -> u64 {
        self.ticks
            .iter()
            .fold(0u64, |h, (&t, &c)| h.wrapping_add(t as u64).wrapping_add(c))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (thd, tick)) in self.ticks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{thd}:{tick}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clocks_are_equal() {
        assert_eq!(VectorClock::new(), VectorClock::new());
    }

    #[test]
    fn increment_is_strictly_monotonic() {
        let mut vc = VectorClock::new();
        for expected in 1..100 {
            vc.increment(3);
            assert_eq!(vc.get(3), expected);
        }
    }

    #[test]
    fn join_takes_pointwise_max() {
        let mut a = VectorClock::new();
        a.increment(1);
        a.increment(1);
        let mut b = VectorClock::new();
        b.increment(1);
        b.increment(2);
        a.join(&b);
        assert_eq!(a.get(1), 2);
        assert_eq!(a.get(2), 1);
    }

    #[test]
    fn happens_before_is_strict() {
        let mut a = VectorClock::new();
        a.increment(1);
        let mut b = a.clone();
        assert!(!a.happens_before(&b), "equal clocks are not ordered");
        b.increment(1);
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn concurrent_clocks_are_unordered() {
        let mut a = VectorClock::new();
        a.increment(1);
        let mut b = VectorClock::new();
        b.increment(2);
        assert!(a.concurrent_with(&b));
        assert!(b.concurrent_with(&a));
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn join_orders_previously_concurrent() {
        let mut a = VectorClock::new();
        a.increment(1);
        let mut b = VectorClock::new();
        b.increment(2);
        b.join(&a);
        b.increment(2);
        assert!(a.happens_before(&b));
    }

    #[test]
    fn absent_components_read_as_zero() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(42), 0);
    }
}
