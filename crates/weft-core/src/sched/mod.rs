//! Schedulers: priority machinery shared by the active, random and PCT
//! schedulers.
//!
//! All three steer the program under test by manipulating thread
//! priorities on a single pinned CPU. Under the POSIX realtime policy the
//! highest-priority runnable thread owns the CPU, so demoting a thread
//! deschedules it as long as any higher-priority thread can run.
//!
//! The OS-level mechanics sit behind [`PriorityControl`]: the realtime
//! backend issues the actual syscalls, the cooperative backend emulates
//! strict priority scheduling in-process (no privileges needed, used by
//! tests and demo runs), and tests use a recording fake.

pub mod active;
pub mod history;
pub mod pct;
pub mod random;
pub mod status;

pub use active::ActiveScheduler;
pub use history::{RunHistory, TestHistory};
pub use pct::PctScheduler;
pub use random::RandomScheduler;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use rand::seq::SliceRandom;

use crate::event::ThreadId;
use crate::options::Options;

/// The five priority bands used for steering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityBands {
    pub min: i32,
    pub lower: i32,
    pub normal: i32,
    pub higher: i32,
    pub max: i32,
}

impl PriorityBands {
    /// Spread the bands over the configured realtime range.
    pub fn from_options(opts: &Options) -> Self {
        let low = opts.lowest_realtime_priority;
        let high = opts.highest_realtime_priority;
        let normal = low + (high - low) / 2;
        Self {
            min: low,
            lower: (normal - 1).max(low),
            normal,
            higher: (normal + 1).min(high),
            max: high,
        }
    }

    /// A shuffled pool of distinct priorities above normal, handed to new
    /// threads so sibling threads never tie.
    pub fn shuffled_new_thread_pool<R: rand::Rng>(&self, rng: &mut R) -> Vec<i32> {
        let mut pool: Vec<i32> = (self.normal + 1..=self.max).collect();
        if pool.is_empty() {
            pool.push(self.normal);
        }
        pool.shuffle(rng);
        pool
    }
}

/// OS-facing side of the schedulers.
///
/// `yield_point` runs in the calling application thread and is the only
/// entry allowed to park it.
pub trait PriorityControl: Send + Sync {
    /// Pin the process and prepare the backend. Fatal on failure.
    fn init(&self, cpu: usize) -> io::Result<()>;

    /// Record a thread and its starting priority.
    fn register_thread(&self, thd: ThreadId, priority: i32);

    /// Change a thread's priority.
    fn set_priority(&self, thd: ThreadId, priority: i32);

    /// Mark a thread blocked (or unblocked) on an application lock, so a
    /// blocked thread never counts as runnable.
    fn set_blocked(&self, thd: ThreadId, blocked: bool);

    /// Deschedule the calling thread while a higher-priority runnable
    /// thread exists.
    fn yield_point(&self, thd: ThreadId);

    fn thread_exit(&self, thd: ThreadId);
}

// ---------------------------------------------------------------------------
// Realtime backend
// ---------------------------------------------------------------------------

/// Priority control through the POSIX realtime scheduler (SCHED_FIFO).
///
/// Threads attach lazily: the first callback that runs on an application
/// thread records its kernel tid, and any priority set before that point
/// is applied then.
pub struct RtControl {
    state: Mutex<RtState>,
}

#[derive(Default)]
struct RtState {
    tids: HashMap<ThreadId, libc::pid_t>,
    pending: HashMap<ThreadId, i32>,
}

impl RtControl {
    pub fn new() -> Self {
        Self { state: Mutex::new(RtState::default()) }
    }

    /// Attach the calling OS thread as `thd`, applying any pending
    /// priority. Must be called from the thread itself.
    pub fn attach_current(&self, thd: ThreadId) {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.tids.insert(thd, tid);
            state.pending.remove(&thd)
        };
        if let Some(priority) = pending {
            Self::apply(tid, priority);
        }
    }

    fn apply(tid: libc::pid_t, priority: i32) {
        let param = libc::sched_param { sched_priority: priority };
        let rc = unsafe { libc::sched_setscheduler(tid, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            // Scheduling failures are fatal by policy; surface loudly.
            panic!(
                "sched_setscheduler({tid}, FIFO, {priority}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Default for RtControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityControl for RtControl {
    fn init(&self, cpu: usize) -> io::Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        // Probe that realtime priorities are grantable at all.
        let param = libc::sched_param {
            sched_priority: unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) },
        };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn register_thread(&self, thd: ThreadId, priority: i32) {
        let mut state = self.state.lock().unwrap();
        match state.tids.get(&thd) {
            Some(&tid) => Self::apply(tid, priority),
            None => {
                state.pending.insert(thd, priority);
            }
        }
    }

    fn set_priority(&self, thd: ThreadId, priority: i32) {
        let mut state = self.state.lock().unwrap();
        match state.tids.get(&thd) {
            Some(&tid) => Self::apply(tid, priority),
            None => {
                state.pending.insert(thd, priority);
            }
        }
    }

    fn set_blocked(&self, _thd: ThreadId, _blocked: bool) {
        // The kernel already knows; nothing to emulate.
    }

    fn yield_point(&self, thd: ThreadId) {
        self.attach_current(thd);
        // Under SCHED_FIFO the priority change itself preempts; a yield
        // here only covers same-priority siblings.
        unsafe {
            libc::sched_yield();
        }
    }

    fn thread_exit(&self, thd: ThreadId) {
        let mut state = self.state.lock().unwrap();
        state.tids.remove(&thd);
        state.pending.remove(&thd);
    }
}

// ---------------------------------------------------------------------------
// Cooperative backend
// ---------------------------------------------------------------------------

/// In-process emulation of strict priority scheduling on one virtual CPU.
///
/// A thread parks at its yield points while any other live, unblocked
/// thread holds a strictly higher priority. Blocked threads (waiting on
/// an application lock) never keep others parked. Parking is bounded so a
/// policy bug degrades to an unsteered run instead of a hang.
pub struct CoopControl {
    state: Mutex<CoopState>,
    cv: Condvar,
    park_limit: Duration,
}

#[derive(Default)]
struct CoopState {
    priority: HashMap<ThreadId, i32>,
    blocked: HashSet<ThreadId>,
    exited: HashSet<ThreadId>,
}

impl CoopControl {
    pub fn new() -> Self {
        Self::with_park_limit(Duration::from_secs(5))
    }

    pub fn with_park_limit(park_limit: Duration) -> Self {
        Self {
            state: Mutex::new(CoopState::default()),
            cv: Condvar::new(),
            park_limit,
        }
    }

    fn someone_outranks(state: &CoopState, thd: ThreadId) -> bool {
        let own = state.priority.get(&thd).copied().unwrap_or(i32::MAX);
        state.priority.iter().any(|(&other, &prio)| {
            other != thd
                && prio > own
                && !state.blocked.contains(&other)
                && !state.exited.contains(&other)
        })
    }
}

impl Default for CoopControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityControl for CoopControl {
    fn init(&self, _cpu: usize) -> io::Result<()> {
        Ok(())
    }

    fn register_thread(&self, thd: ThreadId, priority: i32) {
        self.state.lock().unwrap().priority.insert(thd, priority);
        self.cv.notify_all();
    }

    fn set_priority(&self, thd: ThreadId, priority: i32) {
        self.state.lock().unwrap().priority.insert(thd, priority);
        self.cv.notify_all();
    }

    fn set_blocked(&self, thd: ThreadId, blocked: bool) {
        let mut state = self.state.lock().unwrap();
        if blocked {
            state.blocked.insert(thd);
        } else {
            state.blocked.remove(&thd);
        }
        drop(state);
        self.cv.notify_all();
    }

    fn yield_point(&self, thd: ThreadId) {
        let deadline = Instant::now() + self.park_limit;
        let mut state = self.state.lock().unwrap();
        while Self::someone_outranks(&state, thd) {
            let now = Instant::now();
            if now >= deadline {
                debug!("coop: park limit reached for thread {thd}");
                break;
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
    }

    fn thread_exit(&self, thd: ThreadId) {
        let mut state = self.state.lock().unwrap();
        state.exited.insert(thd);
        state.priority.remove(&thd);
        drop(state);
        self.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Recording fake for scheduler unit tests
// ---------------------------------------------------------------------------

/// Records every priority action; never parks.
#[derive(Default)]
pub struct FakeControl {
    pub log: Mutex<Vec<String>>,
    priorities: Mutex<HashMap<ThreadId, i32>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority_of(&self, thd: ThreadId) -> Option<i32> {
        self.priorities.lock().unwrap().get(&thd).copied()
    }

    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut self.log.lock().unwrap())
    }
}

impl PriorityControl for FakeControl {
    fn init(&self, _cpu: usize) -> io::Result<()> {
        Ok(())
    }

    fn register_thread(&self, thd: ThreadId, priority: i32) {
        self.priorities.lock().unwrap().insert(thd, priority);
        self.log.lock().unwrap().push(format!("register:{thd}={priority}"));
    }

    fn set_priority(&self, thd: ThreadId, priority: i32) {
        self.priorities.lock().unwrap().insert(thd, priority);
        self.log.lock().unwrap().push(format!("set:{thd}={priority}"));
    }

    fn set_blocked(&self, thd: ThreadId, blocked: bool) {
        self.log.lock().unwrap().push(format!("blocked:{thd}={blocked}"));
    }

    fn yield_point(&self, _thd: ThreadId) {}

    fn thread_exit(&self, thd: ThreadId) {
        self.log.lock().unwrap().push(format!("exit:{thd}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    #[test]
    fn bands_span_the_configured_range() {
        let opts = Options {
            lowest_realtime_priority: 1,
            highest_realtime_priority: 99,
            ..Options::default()
        };
        let bands = PriorityBands::from_options(&opts);
        assert_eq!(bands.min, 1);
        assert_eq!(bands.max, 99);
        assert!(bands.min < bands.lower);
        assert!(bands.lower < bands.normal);
        assert!(bands.normal < bands.higher);
        assert!(bands.higher <= bands.max);
    }

    #[test]
    fn new_thread_pool_is_distinct_and_above_normal() {
        let opts = Options::default();
        let bands = PriorityBands::from_options(&opts);
        let mut rng = StdRng::seed_from_u64(3);
        let pool = bands.shuffled_new_thread_pool(&mut rng);
        let mut sorted = pool.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), pool.len(), "priorities must be distinct");
        assert!(pool.iter().all(|&p| p > bands.normal));
    }

    #[test]
    fn coop_parks_lower_priority_thread() {
        let control = Arc::new(CoopControl::with_park_limit(Duration::from_millis(500)));
        control.register_thread(0, 10);
        control.register_thread(1, 20);

        let c = Arc::clone(&control);
        let parked = std::thread::spawn(move || {
            let start = Instant::now();
            c.yield_point(0);
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(50));
        // Dropping thread 1 below thread 0 releases the park.
        control.set_priority(1, 5);
        let waited = parked.join().unwrap();
        assert!(waited >= Duration::from_millis(40), "thread 0 should have parked");
    }

    #[test]
    fn coop_ignores_blocked_threads() {
        let control = CoopControl::new();
        control.register_thread(0, 10);
        control.register_thread(1, 20);
        control.set_blocked(1, true);
        // Thread 1 outranks thread 0 but is blocked; no park.
        let start = Instant::now();
        control.yield_point(0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn coop_ignores_exited_threads() {
        let control = CoopControl::new();
        control.register_thread(0, 10);
        control.register_thread(1, 20);
        control.thread_exit(1);
        let start = Instant::now();
        control.yield_point(0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn fake_control_records_actions() {
        let fake = FakeControl::new();
        fake.register_thread(0, 50);
        fake.set_priority(0, 10);
        assert_eq!(fake.priority_of(0), Some(10));
        assert_eq!(fake.take_log(), vec!["register:0=50", "set:0=10"]);
    }
}
