//! The typed event stream consumed by every analyzer.
//!
//! The instrumentation driver (an external collaborator) turns application
//! instructions and libc/pthread calls into these events and delivers them
//! in a total order: events from one thread always arrive in program
//! order, and the controller serializes delivery across threads under a
//! single analysis lock.

use std::sync::Arc;

use crate::registry::Inst;

/// Analyzer-local thread id, assigned at `ThreadStart` in creation order.
pub type ThreadId = u32;

/// Per-thread logical clock: the number of instructions the thread has
/// retired, as counted by the instrumentation driver.
pub type Timestamp = u64;

/// Application virtual address.
pub type Address = u64;

/// Atomic read-modify-write flavor, as classified by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    /// Compare-and-exchange; in libc this is the lock fast path.
    Cmpxchg,
    /// Locked decrement; in libc this is the unlock fast path.
    Dec,
    /// Locked increment.
    Inc,
    /// Exchange.
    Xchg,
    /// Anything else with a lock prefix.
    Other,
}

/// One instrumentation callback.
///
/// Memory events carry the raw `(addr, size)`; analyzers split them into
/// unit-aligned sub-ranges themselves. Mutex lock events are delivered
/// after the acquisition returns, unlock events before the release runs.
#[derive(Debug, Clone)]
pub enum Event {
    ThreadStart {
        thd: ThreadId,
        parent: Option<ThreadId>,
    },
    ThreadExit {
        thd: ThreadId,
        clk: Timestamp,
    },
    MemRead {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
        size: usize,
    },
    MemWrite {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
        size: usize,
    },
    AtomicBefore {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        op: AtomicOp,
        addr: Address,
    },
    AtomicAfter {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        op: AtomicOp,
        addr: Address,
    },
    MutexLock {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    MutexUnlock {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    CondSignal {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    CondBroadcast {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    CondWaitBefore {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        cond: Address,
        mutex: Address,
        timed: bool,
    },
    CondWaitAfter {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        cond: Address,
        mutex: Address,
        timed: bool,
    },
    BarrierWaitBefore {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    BarrierWaitAfter {
        thd: ThreadId,
        clk: Timestamp,
        inst: Arc<Inst>,
        addr: Address,
    },
    /// Delivered after `pthread_join` returns in the parent.
    Join {
        thd: ThreadId,
        clk: Timestamp,
        child: ThreadId,
    },
    /// malloc/calloc/realloc/valloc result, or an image data/bss segment.
    RegionAlloc {
        thd: ThreadId,
        clk: Timestamp,
        addr: Address,
        size: usize,
    },
    /// free, the old half of realloc, or an image unload.
    RegionFree {
        thd: ThreadId,
        clk: Timestamp,
        addr: Address,
    },
    SyscallEntry {
        thd: ThreadId,
        clk: Timestamp,
        num: i64,
    },
    SignalReceived {
        thd: ThreadId,
        clk: Timestamp,
        num: i32,
    },
}

impl Event {
    /// The thread the event was produced on.
    pub fn thread(&self) -> ThreadId {
        match *self {
            Event::ThreadStart { thd, .. }
            | Event::ThreadExit { thd, .. }
            | Event::MemRead { thd, .. }
            | Event::MemWrite { thd, .. }
            | Event::AtomicBefore { thd, .. }
            | Event::AtomicAfter { thd, .. }
            | Event::MutexLock { thd, .. }
            | Event::MutexUnlock { thd, .. }
            | Event::CondSignal { thd, .. }
            | Event::CondBroadcast { thd, .. }
            | Event::CondWaitBefore { thd, .. }
            | Event::CondWaitAfter { thd, .. }
            | Event::BarrierWaitBefore { thd, .. }
            | Event::BarrierWaitAfter { thd, .. }
            | Event::Join { thd, .. }
            | Event::RegionAlloc { thd, .. }
            | Event::RegionFree { thd, .. }
            | Event::SyscallEntry { thd, .. }
            | Event::SignalReceived { thd, .. } => thd,
        }
    }
}

/// A consumer of the event stream.
///
/// Analyzers are driven under the controller's analysis lock, so `&mut
/// self` handlers never race. `program_exit` runs once after the last
/// event, before databases are saved.
pub trait Analyzer: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle one event.
    fn event(&mut self, event: &Event);

    /// Flush end-of-run state (final predictions, database updates).
    fn program_exit(&mut self) {}
}
