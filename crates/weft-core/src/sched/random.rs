//! Randomized baseline scheduler.
//!
//! Picks a set of change points — absolute positions on the global
//! instruction count — and reassigns the crossing thread a uniformly
//! random priority at each one. In delay mode a short sleep replaces the
//! priority change. The change-point range scales with the average
//! execution length from previous runs.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::event::ThreadId;
use crate::exec::Steering;
use crate::options::Options;
use crate::sched::history::RunHistory;
use crate::sched::{PriorityBands, PriorityControl};

/// Change points per run when no history exists yet.
const DEFAULT_CHANGE_POINTS: usize = 10;

/// Fallback length estimate for the first run.
const DEFAULT_LENGTH_ESTIMATE: u64 = 10_000;

pub struct RandomScheduler {
    control: Arc<dyn PriorityControl>,
    bands: PriorityBands,
    delay: bool,
    delay_unit: Duration,
    change_points: Vec<u64>,
    cursor: AtomicU64,
    global_count: AtomicU64,
    num_threads: AtomicU32,
    rng: Mutex<StdRng>,
}

impl RandomScheduler {
    pub fn new(
        opts: &Options,
        control: Arc<dyn PriorityControl>,
        history: &RunHistory,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let length = if history.is_empty() {
            DEFAULT_LENGTH_ESTIMATE
        } else {
            history.avg_inst_count().max(1)
        };
        let mut change_points: Vec<u64> = (0..DEFAULT_CHANGE_POINTS)
            .map(|_| rng.gen_range(1..=length))
            .collect();
        change_points.sort_unstable();
        debug!("random scheduler: change points {change_points:?}");
        Self {
            control,
            bands: PriorityBands::from_options(opts),
            delay: opts.delay,
            delay_unit: Duration::from_micros(opts.delay_unit),
            change_points,
            cursor: AtomicU64::new(0),
            global_count: AtomicU64::new(0),
            num_threads: AtomicU32::new(0),
            rng: Mutex::new(rng),
        }
    }

    /// Totals for the run-history update at exit.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.global_count.load(Ordering::Relaxed),
            self.num_threads.load(Ordering::Relaxed) as u64,
        )
    }

    fn random_priority(&self) -> i32 {
        self.rng.lock().unwrap().gen_range(self.bands.min..=self.bands.max)
    }

    fn crossed_change_point(&self, ticks: u64) -> bool {
        let before = self.global_count.fetch_add(ticks, Ordering::Relaxed);
        let after = before + ticks;
        let cursor = self.cursor.load(Ordering::Relaxed) as usize;
        if cursor >= self.change_points.len() {
            return false;
        }
        if self.change_points[cursor] <= after {
            self.cursor.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn change(&self, thd: ThreadId) {
        if self.delay {
            std::thread::sleep(self.delay_unit);
        } else {
            let priority = self.random_priority();
            debug!("random scheduler: thread {thd} -> priority {priority}");
            self.control.set_priority(thd, priority);
        }
    }
}

impl Steering for RandomScheduler {
    fn thread_start(&self, thd: ThreadId, _parent: Option<ThreadId>) {
        self.num_threads.fetch_add(1, Ordering::Relaxed);
        let priority = self.random_priority();
        self.control.register_thread(thd, priority);
    }

    fn thread_exit(&self, thd: ThreadId) {
        self.control.thread_exit(thd);
    }

    fn inst_count(&self, thd: ThreadId, count: u64) {
        if self.crossed_change_point(count) {
            self.change(thd);
        }
    }

    fn before_block(&self, thd: ThreadId) {
        self.control.set_blocked(thd, true);
    }

    fn after_block(&self, thd: ThreadId) {
        self.control.set_blocked(thd, false);
    }

    fn yield_point(&self, thd: ThreadId) {
        self.control.yield_point(thd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::FakeControl;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn threads_get_priorities_in_range() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let sched =
            RandomScheduler::new(&opts(), Arc::clone(&control) as _, &history, 42);
        let bands = PriorityBands::from_options(&opts());
        for thd in 0..5 {
            sched.thread_start(thd, None);
            let p = control.priority_of(thd).unwrap();
            assert!(p >= bands.min && p <= bands.max);
        }
        let (_, threads) = sched.stats();
        assert_eq!(threads, 5);
    }

    #[test]
    fn change_points_fire_once_each() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let sched =
            RandomScheduler::new(&opts(), Arc::clone(&control) as _, &history, 7);
        sched.thread_start(0, None);
        control.take_log();

        // Plow through far more instructions than the whole range.
        for _ in 0..1000 {
            sched.inst_count(0, 100);
        }
        let changes = control
            .take_log()
            .iter()
            .filter(|l| l.starts_with("set:"))
            .count();
        assert_eq!(changes, DEFAULT_CHANGE_POINTS);
    }

    #[test]
    fn same_seed_same_change_points() {
        let history = RunHistory::new();
        let a = RandomScheduler::new(&opts(), Arc::new(FakeControl::new()) as _, &history, 5);
        let b = RandomScheduler::new(&opts(), Arc::new(FakeControl::new()) as _, &history, 5);
        assert_eq!(a.change_points, b.change_points);
    }

    #[test]
    fn history_scales_the_range() {
        let mut history = RunHistory::new();
        history.update(100, 2);
        let sched =
            RandomScheduler::new(&opts(), Arc::new(FakeControl::new()) as _, &history, 11);
        assert!(sched.change_points.iter().all(|&p| p <= 100));
    }

    #[test]
    fn global_count_accumulates_across_threads() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let sched =
            RandomScheduler::new(&opts(), Arc::clone(&control) as _, &history, 3);
        sched.thread_start(0, None);
        sched.thread_start(1, Some(0));
        sched.inst_count(0, 50);
        sched.inst_count(1, 70);
        let (count, _) = sched.stats();
        assert_eq!(count, 120);
    }
}
