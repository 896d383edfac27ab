//! Persisted run histories.
//!
//! The active scheduler logs every test run (target iRoot, seed, outcome)
//! so later campaigns can see how often a candidate was tried. The random
//! and PCT schedulers keep running averages of execution length and
//! thread count, used to scale the next run's change-point range.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dbfile;
use crate::iroot::IrootId;

/// One active-test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub iroot_id: IrootId,
    pub seed: u64,
    pub success: bool,
}

/// Active-testing history (`history.db`).
#[derive(Debug, Default)]
pub struct TestHistory {
    runs: Vec<TestRun>,
    current: Option<TestRun>,
}

impl TestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry for the run about to start.
    pub fn create_entry(&mut self, iroot_id: IrootId, seed: u64) {
        self.current = Some(TestRun { iroot_id, seed, success: false });
    }

    /// Record the outcome of the current run.
    pub fn update_result(&mut self, success: bool) {
        if let Some(run) = self.current.as_mut() {
            run.success = success;
        }
    }

    /// Number of recorded runs that targeted `iroot_id`.
    pub fn total_test_runs(&self, iroot_id: IrootId) -> usize {
        self.runs.iter().filter(|r| r.iroot_id == iroot_id).count()
            + usize::from(self.current.map(|r| r.iroot_id) == Some(iroot_id))
    }

    pub fn runs(&self) -> &[TestRun] {
        &self.runs
    }

    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        self.runs = dbfile::load_list(path)?;
        Ok(())
    }

    pub fn save(&mut self, path: &Path) -> io::Result<()> {
        if let Some(run) = self.current.take() {
            self.runs.push(run);
        }
        dbfile::save_list(path, &self.runs)
    }
}

/// One profiled execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunStats {
    pub inst_count: u64,
    pub num_threads: u64,
}

/// Random/PCT run history (`sched_history.db`).
#[derive(Debug, Default)]
pub struct RunHistory {
    entries: Vec<RunStats>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn avg_inst_count(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let total: u64 = self.entries.iter().map(|e| e.inst_count).sum();
        total / self.entries.len() as u64
    }

    pub fn avg_num_threads(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let total: u64 = self.entries.iter().map(|e| e.num_threads).sum();
        total / self.entries.len() as u64
    }

    pub fn update(&mut self, inst_count: u64, num_threads: u64) {
        self.entries.push(RunStats { inst_count, num_threads });
    }

    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        self.entries = dbfile::load_list(path)?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        dbfile::save_list(path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_counts_runs_per_iroot() {
        let mut h = TestHistory::new();
        h.create_entry(7, 1);
        h.update_result(false);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        h.save(&path).unwrap();
        h.create_entry(7, 2);
        h.update_result(true);
        assert_eq!(h.total_test_runs(7), 2);
        assert_eq!(h.total_test_runs(8), 0);
    }

    #[test]
    fn test_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let mut h = TestHistory::new();
        h.create_entry(3, 99);
        h.update_result(true);
        h.save(&path).unwrap();

        let mut h2 = TestHistory::new();
        h2.load(&path).unwrap();
        assert_eq!(h2.runs().len(), 1);
        assert_eq!(h2.runs()[0], TestRun { iroot_id: 3, seed: 99, success: true });
    }

    #[test]
    fn run_history_averages() {
        let mut h = RunHistory::new();
        assert_eq!(h.avg_inst_count(), 0);
        h.update(100, 2);
        h.update(300, 4);
        assert_eq!(h.avg_inst_count(), 200);
        assert_eq!(h.avg_num_threads(), 3);
    }

    #[test]
    fn run_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched_history.db");
        let mut h = RunHistory::new();
        h.update(1000, 3);
        h.save(&path).unwrap();
        let mut h2 = RunHistory::new();
        h2.load(&path).unwrap();
        assert_eq!(h2.avg_inst_count(), 1000);
        assert_eq!(h2.avg_num_threads(), 3);
    }
}
