//! # weft-scenarios
//!
//! Instrumented concurrency-bug scenario programs.
//!
//! Each scenario is a small multithreaded program with a known latent
//! interleaving bug — a lost update, a cross-critical-section atomicity
//! violation, an AB/BA deadlock. The programs report their own memory and
//! synchronization events through [`weft_core::exec::Probe`] handles, so
//! they run unmodified under the predictor, the observer, or any of the
//! schedulers.
//!
//! Scenarios double as the end-to-end seeds of the test suite and as demo
//! workloads for the CLI.

pub mod bank_account;
pub mod circular_list;
pub mod cond_signal;
pub mod deadlock;
pub mod shared_counter;
pub mod string_buffer;

use std::sync::Arc;

use weft_core::exec::Controller;

pub use bank_account::BankAccount;
pub use circular_list::CircularList;
pub use cond_signal::CondSignal;
pub use deadlock::Deadlock;
pub use shared_counter::SharedCounter;
pub use string_buffer::StringBuffer;

/// What a scenario run reported.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    /// Human-readable result line.
    pub summary: String,
    /// Whether the program's own correctness invariant was violated —
    /// i.e. the latent bug manifested in this run.
    pub invariant_violated: bool,
}

/// A runnable instrumented program.
pub trait Scenario: Send + Sync {
    /// Short identifier used by the CLI.
    fn name(&self) -> &'static str;

    /// One-line description of the latent bug.
    fn description(&self) -> &'static str;

    /// Run the program to completion against the given controller,
    /// creating its own threads and probes.
    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome;
}

/// All scenarios in their default (safe-to-profile) configuration.
pub fn all_scenarios() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(SharedCounter::default()),
        Box::new(BankAccount::default()),
        Box::new(CircularList::default()),
        Box::new(Deadlock::default()),
        Box::new(CondSignal::default()),
        Box::new(StringBuffer::default()),
    ]
}

/// Find a scenario by name.
pub fn find_scenario(name: &str) -> Option<Box<dyn Scenario>> {
    all_scenarios().into_iter().find(|s| s.name() == name)
}

/// Find a scenario with its safety serialization removed, for runs that
/// *want* the bug to manifest (active testing).
pub fn find_scenario_racy(name: &str) -> Option<Box<dyn Scenario>> {
    match name {
        "deadlock" => Some(Box::new(Deadlock { serialize: false, ..Deadlock::default() })),
        _ => find_scenario(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_complete() {
        let names: Vec<_> = all_scenarios().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "shared_counter",
                "bank_account",
                "circular_list",
                "deadlock",
                "cond_signal",
                "string_buffer",
            ]
        );
    }

    #[test]
    fn find_by_name() {
        assert!(find_scenario("deadlock").is_some());
        assert!(find_scenario("nope").is_none());
    }
}
