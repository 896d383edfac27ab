//! # weft-core
//!
//! **Drive multithreaded programs toward the interleavings that break them.**
//!
//! `weft-core` is the analysis library behind weft. It watches one or more
//! executions of a multithreaded program, records the inter-thread
//! dependencies between memory and synchronization events, and extrapolates
//! which *other* interleavings would have been feasible under a different
//! schedule. Each feasible dependency pattern — an *iRoot* — is stored in a
//! persistent database. A later run can then be steered toward a chosen
//! iRoot with thread-priority manipulation, confirming or refuting it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_core::exec::Controller;
//! use weft_core::options::Options;
//!
//! // Build a controller that predicts candidate interleavings.
//! let opts = Options::default();
//! let ctrl = Arc::new(Controller::for_prediction(&opts));
//!
//! // The program under test emits events through per-thread probes.
//! let mut probe = ctrl.main_thread();
//! let inst = ctrl.registry().pseudo_inst(0x40);
//! probe.region_alloc(0x1000, 4);
//! probe.mem_write(&inst, 0x1000, 4, || ());
//! probe.thread_exit();
//! ctrl.program_exit();
//! ```
//!
//! ## Architecture
//!
//! Events → Controller (kernel lock) → Analyzers (observer, predictor)
//! → iRoot DB + memoization → candidate selection → active scheduler.
//!
//! Five idiom shapes are tracked:
//! - **Idiom 1**: one dependency `A → B` between two threads.
//! - **Idiom 2**: `A; (remote C); B` with A and B in one thread.
//! - **Idiom 3**: two nested dependencies over the *same* location.
//! - **Idiom 4**: two nested dependencies over *two* locations.
//! - **Idiom 5**: two dependencies with reversed timing — the deadlock shape.
//!
//! Analyzers run inline with the application threads under a single global
//! analysis lock, so every analyzer sees one totally ordered event stream.

pub mod clock;
pub mod dbfile;
pub mod event;
pub mod exec;
pub mod filter;
pub mod iroot;
pub mod lockset;
pub mod memo;
pub mod observer;
pub mod options;
pub mod predict;
pub mod registry;
pub mod sched;
pub mod sinst;

pub use clock::VectorClock;
pub use event::{Address, Event, ThreadId, Timestamp};
pub use iroot::{EventKind, Idiom, Iroot, IrootDb, IrootEvent};
pub use memo::Memo;
pub use registry::{Image, Inst, StaticRegistry};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
