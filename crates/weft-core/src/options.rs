//! Analysis and scheduling knobs.
//!
//! One plain struct holds every recognized option; the CLI fills it from
//! flags, library users fill it directly. The core never reads the
//! environment.

use std::path::PathBuf;

use crate::iroot::IrootId;

/// All recognized knobs with their defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Memory access granularity in bytes. Accesses are split into
    /// unit-aligned sub-ranges of this size.
    pub unit_size: u64,
    /// Vulnerability window in dynamic instructions: the bound within
    /// which two local events count as paired for compound idioms.
    pub vw: u64,
    /// Only monitor synchronization accesses.
    pub sync_only: bool,
    /// Target compound idioms (2–5) in addition to idiom 1.
    pub complex_idioms: bool,
    /// Skip the multi-variable idioms (4 and 5).
    pub single_var_idioms: bool,
    /// Only consider sync dependencies and memory dependencies already
    /// established as racy.
    pub racy_only: bool,
    /// Emit deadlock-shaped idiom-5 candidates.
    pub predict_deadlock: bool,
    /// Drop accesses from common system libraries.
    pub ignore_lib: bool,
    /// Record observed iRoots into the shadow-exposed set.
    pub shadow_observer: bool,
    /// When non-zero, the active scheduler tests exactly this iRoot.
    pub target_iroot: IrootId,
    /// Lowest realtime priority the schedulers may assign.
    pub lowest_realtime_priority: i32,
    /// Highest realtime priority the schedulers may assign.
    pub highest_realtime_priority: i32,
    /// CPU index to pin the program to while scheduling.
    pub cpu: usize,
    /// Random scheduler: insert sleeps at change points instead of
    /// priority changes.
    pub delay: bool,
    /// Random scheduler: sleep length per delay, in microseconds.
    pub delay_unit: u64,
    /// PCT scheduler: number of priority change points.
    pub depth: usize,
    /// Random seed for the schedulers; 0 draws one from the OS.
    pub seed: u64,
    /// Directory holding the persisted databases.
    pub db_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            unit_size: 4,
            vw: 1000,
            sync_only: false,
            complex_idioms: false,
            single_var_idioms: false,
            racy_only: false,
            predict_deadlock: false,
            ignore_lib: false,
            shadow_observer: false,
            target_iroot: 0,
            lowest_realtime_priority: 1,
            highest_realtime_priority: 99,
            cpu: 0,
            delay: false,
            delay_unit: 10,
            depth: 3,
            seed: 0,
            db_dir: PathBuf::from("."),
        }
    }
}

impl Options {
    /// Path of the static registry database.
    pub fn sinfo_db(&self) -> PathBuf {
        self.db_dir.join("sinfo.db")
    }

    /// Path of the iRoot database.
    pub fn iroot_db(&self) -> PathBuf {
        self.db_dir.join("iroot.db")
    }

    /// Path of the memoization database.
    pub fn memo_db(&self) -> PathBuf {
        self.db_dir.join("memo.db")
    }

    /// Path of the shared-instruction database.
    pub fn sinst_db(&self) -> PathBuf {
        self.db_dir.join("sinst.db")
    }

    /// Path of the per-run predicted-iroot list.
    pub fn ilist_db(&self) -> PathBuf {
        self.db_dir.join("ilist.db")
    }

    /// Path of the active-test history.
    pub fn history_db(&self) -> PathBuf {
        self.db_dir.join("history.db")
    }

    /// Path of the random/PCT run history.
    pub fn sched_history_db(&self) -> PathBuf {
        self.db_dir.join("sched_history.db")
    }

    /// Validate cross-knob constraints. Configuration errors are fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.unit_size == 0 || !self.unit_size.is_power_of_two() {
            return Err(format!("unit_size must be a power of two, got {}", self.unit_size));
        }
        if self.vw == 0 {
            return Err("vw must be positive".into());
        }
        if self.lowest_realtime_priority >= self.highest_realtime_priority {
            return Err(format!(
                "priority range collapses: [{}, {}]",
                self.lowest_realtime_priority, self.highest_realtime_priority
            ));
        }
        Ok(())
    }

    /// Align an address down to the monitoring unit.
    pub fn unit_down(&self, addr: u64) -> u64 {
        addr & !(self.unit_size - 1)
    }

    /// Align an address up to the monitoring unit.
    pub fn unit_up(&self, addr: u64) -> u64 {
        (addr + self.unit_size - 1) & !(self.unit_size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn unit_alignment() {
        let opts = Options::default();
        assert_eq!(opts.unit_down(0x1003), 0x1000);
        assert_eq!(opts.unit_up(0x1001), 0x1004);
        assert_eq!(opts.unit_up(0x1004), 0x1004);
    }

    #[test]
    fn collapsed_priority_range_is_rejected() {
        let opts = Options {
            lowest_realtime_priority: 50,
            highest_realtime_priority: 50,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn bad_unit_size_is_rejected() {
        let opts = Options { unit_size: 3, ..Options::default() };
        assert!(opts.validate().is_err());
    }
}
