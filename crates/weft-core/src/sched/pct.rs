//! PCT baseline scheduler.
//!
//! Probabilistic concurrency testing: every new thread draws the next
//! priority from a pre-shuffled pool, and `d` change points are drawn
//! uniformly over the estimated run length. At each change point the
//! crossing thread drops to the next unused low priority, which bounds
//! the depth of the ordering bug the schedule can expose.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::event::ThreadId;
use crate::exec::Steering;
use crate::options::Options;
use crate::sched::history::RunHistory;
use crate::sched::{PriorityBands, PriorityControl};

/// Fallback length estimate for the first run.
const DEFAULT_LENGTH_ESTIMATE: u64 = 10_000;

pub struct PctScheduler {
    control: Arc<dyn PriorityControl>,
    bands: PriorityBands,
    change_points: Vec<u64>,
    state: Mutex<PctState>,
    global_count: AtomicU64,
    num_threads: AtomicU32,
}

struct PctState {
    new_thread_priorities: Vec<i32>,
    new_thread_cursor: usize,
    change_priorities: Vec<i32>,
    change_cursor: usize,
    points_cursor: usize,
}

impl PctScheduler {
    pub fn new(
        opts: &Options,
        control: Arc<dyn PriorityControl>,
        history: &RunHistory,
        seed: u64,
    ) -> Self {
        let bands = PriorityBands::from_options(opts);
        let mut rng = StdRng::seed_from_u64(seed);
        let length = if history.is_empty() {
            DEFAULT_LENGTH_ESTIMATE
        } else {
            history.avg_inst_count().max(1)
        };
        let mut change_points: Vec<u64> =
            (0..opts.depth).map(|_| rng.gen_range(1..=length)).collect();
        change_points.sort_unstable();

        let new_thread_priorities = bands.shuffled_new_thread_pool(&mut rng);
        // Demotion targets: the lowest band upward, one per change point.
        let change_priorities: Vec<i32> =
            (0..opts.depth as i32).map(|k| (bands.min + k).min(bands.normal)).collect();
        debug!("pct scheduler: d={} change points {change_points:?}", opts.depth);
        Self {
            control,
            bands,
            change_points,
            state: Mutex::new(PctState {
                new_thread_priorities,
                new_thread_cursor: 0,
                change_priorities,
                change_cursor: 0,
                points_cursor: 0,
            }),
            global_count: AtomicU64::new(0),
            num_threads: AtomicU32::new(0),
        }
    }

    /// Totals for the run-history update at exit.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.global_count.load(Ordering::Relaxed),
            self.num_threads.load(Ordering::Relaxed) as u64,
        )
    }

    fn next_new_thread_priority(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        let pool = &state.new_thread_priorities;
        let priority = pool[state.new_thread_cursor % pool.len()];
        state.new_thread_cursor += 1;
        priority
    }

    fn crossed_change_point(&self, ticks: u64) -> Option<i32> {
        let before = self.global_count.fetch_add(ticks, Ordering::Relaxed);
        let after = before + ticks;
        let mut state = self.state.lock().unwrap();
        if state.points_cursor >= self.change_points.len() {
            return None;
        }
        if self.change_points[state.points_cursor] <= after {
            state.points_cursor += 1;
            let priority = state
                .change_priorities
                .get(state.change_cursor)
                .copied()
                .unwrap_or(self.bands.min);
            state.change_cursor += 1;
            Some(priority)
        } else {
            None
        }
    }
}

impl Steering for PctScheduler {
    fn thread_start(&self, thd: ThreadId, _parent: Option<ThreadId>) {
        self.num_threads.fetch_add(1, Ordering::Relaxed);
        let priority = self.next_new_thread_priority();
        self.control.register_thread(thd, priority);
    }

    fn thread_exit(&self, thd: ThreadId) {
        self.control.thread_exit(thd);
    }

    fn inst_count(&self, thd: ThreadId, count: u64) {
        if let Some(priority) = self.crossed_change_point(count) {
            debug!("pct scheduler: demoting thread {thd} to {priority}");
            self.control.set_priority(thd, priority);
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

    #[test]
    fn new_threads_draw_distinct_high_priorities() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let opts = Options::default();
        let sched = PctScheduler::new(&opts, Arc::clone(&control) as _, &history, 9);
        let bands = PriorityBands::from_options(&opts);

        let mut seen = Vec::new();
        for thd in 0..4 {
            sched.thread_start(thd, None);
            seen.push(control.priority_of(thd).unwrap());
        }
        let mut dedup = seen.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), seen.len());
        assert!(seen.iter().all(|&p| p > bands.normal));
    }

    #[test]
    fn at_most_depth_demotions() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let opts = Options { depth: 3, ..Options::default() };
        let sched = PctScheduler::new(&opts, Arc::clone(&control) as _, &history, 1);
        sched.thread_start(0, None);
        control.take_log();

        for _ in 0..1000 {
            sched.inst_count(0, 100);
        }
        let demotions = control
            .take_log()
            .iter()
            .filter(|l| l.starts_with("set:"))
            .count();
        assert_eq!(demotions, 3);
    }

    #[test]
    fn demotions_walk_up_from_the_bottom() {
        let control = Arc::new(FakeControl::new());
        let history = RunHistory::new();
        let opts = Options { depth: 2, ..Options::default() };
        let bands = PriorityBands::from_options(&opts);
        let sched = PctScheduler::new(&opts, Arc::clone(&control) as _, &history, 1);
        sched.thread_start(0, None);

        let mut priorities = Vec::new();
        for _ in 0..1000 {
            sched.inst_count(0, 100);
        }
        for line in control.take_log() {
            if let Some(rest) = line.strip_prefix("set:0=") {
                priorities.push(rest.parse::<i32>().unwrap());
            }
        }
        assert_eq!(priorities, vec![bands.min, bands.min + 1]);
    }
}
