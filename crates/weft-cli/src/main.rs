//! CLI for weft — drive programs toward the interleavings that break them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use weft_core::dbfile;
use weft_core::exec::Controller;
use weft_core::iroot::IrootId;
use weft_core::options::Options;
use weft_core::sched::{
    ActiveScheduler, CoopControl, PctScheduler, PriorityBands, PriorityControl, RandomScheduler,
    RtControl, RunHistory, TestHistory,
};
use weft_scenarios::{all_scenarios, find_scenario, find_scenario_racy, Scenario};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "weft — predict and actively test interleaving idioms")]
#[command(version = weft_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Analysis knobs shared by every subcommand.
#[derive(Args)]
struct Knobs {
    /// Directory holding the persisted databases
    #[arg(long, default_value = ".")]
    db_dir: PathBuf,

    /// Memory access granularity in bytes
    #[arg(long, default_value_t = 4)]
    unit_size: u64,

    /// Vulnerability window in dynamic instructions
    #[arg(long, default_value_t = 1000)]
    vw: u64,

    /// Limit analysis to synchronization events
    #[arg(long)]
    sync_only: bool,

    /// Target compound idioms (2-5)
    #[arg(long)]
    complex_idioms: bool,

    /// Skip the multi-variable idioms (4 and 5)
    #[arg(long)]
    single_var_idioms: bool,

    /// Drop pairs already established as race-free
    #[arg(long)]
    racy_only: bool,

    /// Emit deadlock-shaped idiom-5 candidates
    #[arg(long)]
    predict_deadlock: bool,

    /// Drop accesses from common system libraries
    #[arg(long)]
    ignore_lib: bool,

    /// Record observed iRoots as shadow exposures
    #[arg(long)]
    shadow_observer: bool,

    /// Test only this iRoot id (0 picks from the memo)
    #[arg(long, default_value_t = 0)]
    target_iroot: IrootId,

    /// Lowest realtime priority to use
    #[arg(long, default_value_t = 1)]
    lowest_realtime_priority: i32,

    /// Highest realtime priority to use
    #[arg(long, default_value_t = 99)]
    highest_realtime_priority: i32,

    /// CPU index to pin on
    #[arg(long, default_value_t = 0)]
    cpu: usize,

    /// Random scheduler: sleep at change points instead of reprioritizing
    #[arg(long)]
    delay: bool,

    /// Random scheduler: sleep length per delay in microseconds
    #[arg(long, default_value_t = 10)]
    delay_unit: u64,

    /// PCT scheduler: number of priority change points
    #[arg(long, default_value_t = 3)]
    depth: usize,

    /// Random seed (0 draws one from the OS)
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Knobs {
    fn to_options(&self) -> Options {
        Options {
            unit_size: self.unit_size,
            vw: self.vw,
            sync_only: self.sync_only,
            complex_idioms: self.complex_idioms,
            single_var_idioms: self.single_var_idioms,
            racy_only: self.racy_only,
            predict_deadlock: self.predict_deadlock,
            ignore_lib: self.ignore_lib,
            shadow_observer: self.shadow_observer,
            target_iroot: self.target_iroot,
            lowest_realtime_priority: self.lowest_realtime_priority,
            highest_realtime_priority: self.highest_realtime_priority,
            cpu: self.cpu,
            delay: self.delay,
            delay_unit: self.delay_unit,
            depth: self.depth,
            seed: self.seed,
            db_dir: self.db_dir.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the bundled scenario programs
    List,

    /// Run a scenario under observer + predictor, growing the databases
    Profile {
        /// Scenario name (see `weft list`)
        scenario: String,

        #[command(flatten)]
        knobs: Knobs,
    },

    /// Run a scenario under the active scheduler against one candidate
    Active {
        /// Scenario name
        scenario: String,

        /// Emulate priority scheduling in-process instead of SCHED_FIFO
        /// (no privileges needed)
        #[arg(long)]
        coop: bool,

        /// Wall-clock watchdog for deadlock-shaped targets, seconds
        #[arg(long, default_value_t = 10)]
        watchdog: u64,

        #[command(flatten)]
        knobs: Knobs,
    },

    /// Run a scenario under the randomized baseline scheduler
    Random {
        /// Scenario name
        scenario: String,

        /// Emulate priority scheduling in-process
        #[arg(long)]
        coop: bool,

        #[command(flatten)]
        knobs: Knobs,
    },

    /// Run a scenario under the PCT baseline scheduler
    Pct {
        /// Scenario name
        scenario: String,

        /// Emulate priority scheduling in-process
        #[arg(long)]
        coop: bool,

        #[command(flatten)]
        knobs: Knobs,
    },

    /// Report database contents: candidates, exposures, predictions
    Memo {
        #[command(flatten)]
        knobs: Knobs,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match Cli::parse().command {
        Commands::List => {
            for scenario in all_scenarios() {
                println!("{:<16} {}", scenario.name(), scenario.description());
            }
            ExitCode::SUCCESS
        }
        Commands::Profile { scenario, knobs } => cmd_profile(&scenario, &knobs),
        Commands::Active { scenario, coop, watchdog, knobs } => {
            cmd_active(&scenario, coop, watchdog, &knobs)
        }
        Commands::Random { scenario, coop, knobs } => cmd_random(&scenario, coop, &knobs),
        Commands::Pct { scenario, coop, knobs } => cmd_pct(&scenario, coop, &knobs),
        Commands::Memo { knobs } => cmd_memo(&knobs),
    }
}

fn load_scenario(name: &str) -> Result<Box<dyn Scenario>, ExitCode> {
    find_scenario(name).ok_or_else(|| {
        error!("unknown scenario '{name}'; try `weft list`");
        ExitCode::FAILURE
    })
}

fn validated_options(knobs: &Knobs) -> Result<Options, ExitCode> {
    let opts = knobs.to_options();
    match opts.validate() {
        Ok(()) => Ok(opts),
        Err(msg) => {
            error!("invalid configuration: {msg}");
            Err(ExitCode::FAILURE)
        }
    }
}

fn effective_seed(opts: &Options) -> u64 {
    if opts.seed != 0 {
        return opts.seed;
    }
    rand::random::<u64>() | 1
}

/// Build the realtime or cooperative backend. A realtime backend that
/// cannot pin the CPU or acquire priority is fatal.
fn make_control(coop: bool, opts: &Options) -> Result<Arc<dyn PriorityControl>, ExitCode> {
    if coop {
        return Ok(Arc::new(CoopControl::new()));
    }
    let control = RtControl::new();
    if let Err(e) = control.init(opts.cpu) {
        error!(
            "cannot acquire realtime scheduling on cpu {} ({e}); rerun privileged or use --coop",
            opts.cpu
        );
        return Err(ExitCode::FAILURE);
    }
    Ok(Arc::new(control))
}

fn cmd_profile(name: &str, knobs: &Knobs) -> ExitCode {
    let opts = match validated_options(knobs) {
        Ok(o) => o,
        Err(code) => return code,
    };
    let scenario = match load_scenario(name) {
        Ok(s) => s,
        Err(code) => return code,
    };

    let ctrl = Arc::new(Controller::for_profile(&opts));
    if let Err(e) = ctrl.load_databases() {
        error!("failed to load databases from {}: {e}", opts.db_dir.display());
        return ExitCode::FAILURE;
    }

    let outcome = scenario.run(&ctrl);
    ctrl.program_exit();
    ctrl.save_databases();

    // Flat list of this run's predictions, for delta workflows.
    let predicted = ctrl.memo().predicted_ids();
    if let Err(e) = dbfile::save_list(&opts.ilist_db(), &predicted) {
        error!("failed to save predicted-iroot list: {e}");
    }

    println!("{}: {}", scenario.name(), outcome.summary);
    println!(
        "predicted {} candidates ({} total in memo)",
        predicted.len(),
        ctrl.memo().total_candidates()
    );
    ExitCode::SUCCESS
}

fn cmd_active(name: &str, coop: bool, watchdog: u64, knobs: &Knobs) -> ExitCode {
    let opts = match validated_options(knobs) {
        Ok(o) => o,
        Err(code) => return code,
    };
    // Active testing wants the raw racy program, not the profiling-safe
    // serialization.
    let Some(scenario) = find_scenario_racy(name) else {
        error!("unknown scenario '{name}'; try `weft list`");
        return ExitCode::FAILURE;
    };

    let ctrl = Arc::new(Controller::new(&opts));
    if let Err(e) = ctrl.load_databases() {
        error!("failed to load databases from {}: {e}", opts.db_dir.display());
        return ExitCode::FAILURE;
    }

    let candidate = if opts.target_iroot != 0 {
        ctrl.memo().choose_by_id(opts.target_iroot)
    } else {
        ctrl.memo().refine_candidates(true);
        ctrl.memo().choose_for_test()
    };
    let Some(iroot) = candidate else {
        info!("no candidate to test; profile first");
        return ExitCode::SUCCESS;
    };
    println!("testing {}", iroot.to_display_string());

    let control = match make_control(coop, &opts) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let seed = effective_seed(&opts);
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(seed);
    let pool = PriorityBands::from_options(&opts).shuffled_new_thread_pool(&mut rng);

    let mut history = TestHistory::new();
    if opts.history_db().exists() {
        if let Err(e) = history.load(&opts.history_db()) {
            error!("failed to load test history: {e}");
            return ExitCode::FAILURE;
        }
    }
    history.create_entry(iroot.id(), seed);

    let sched = Arc::new(ActiveScheduler::new(
        &opts,
        Arc::clone(&iroot),
        Arc::clone(ctrl.memo()),
        control,
        pool,
    ));
    ctrl.set_steering(Arc::clone(&sched) as Arc<dyn weft_core::exec::Steering>);

    // Deadlock-shaped targets hang on success; run the scenario on a
    // worker and watch it.
    let worker = {
        let ctrl = Arc::clone(&ctrl);
        std::thread::spawn(move || scenario.run(&ctrl))
    };
    let deadline = std::time::Instant::now() + Duration::from_secs(watchdog);
    let outcome = loop {
        if worker.is_finished() {
            break Some(worker.join().expect("scenario worker"));
        }
        if std::time::Instant::now() >= deadline {
            break None;
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    match outcome {
        Some(outcome) => {
            ctrl.program_exit();
            println!("{name}: {}", outcome.summary);
            if outcome.invariant_violated {
                println!("invariant violated under steering");
            }
        }
        None => {
            // The run is stuck: for a deadlock target that *is* the
            // exposure. Record the outcome without joining the worker.
            sched.conclude();
            println!("{name}: wall-clock watchdog fired after {watchdog}s");
        }
    }
    println!(
        "iroot {}: {}",
        iroot.id(),
        if sched.exposed() { "exposed" } else { "not exposed" }
    );

    history.update_result(sched.exposed());
    if let Err(e) = history.save(&opts.history_db()) {
        error!("failed to save test history: {e}");
    }
    ctrl.save_databases();
    ExitCode::SUCCESS
}

fn cmd_random(name: &str, coop: bool, knobs: &Knobs) -> ExitCode {
    let opts = match validated_options(knobs) {
        Ok(o) => o,
        Err(code) => return code,
    };
    let scenario = match load_scenario(name) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let control = match make_control(coop, &opts) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let mut history = RunHistory::new();
    if opts.sched_history_db().exists() {
        if let Err(e) = history.load(&opts.sched_history_db()) {
            error!("failed to load scheduler history: {e}");
            return ExitCode::FAILURE;
        }
    }

    let ctrl = Arc::new(Controller::new(&opts));
    let sched = Arc::new(RandomScheduler::new(&opts, control, &history, effective_seed(&opts)));
    ctrl.set_steering(Arc::clone(&sched) as Arc<dyn weft_core::exec::Steering>);

    let outcome = scenario.run(&ctrl);
    ctrl.program_exit();

    let (inst_count, num_threads) = sched.stats();
    history.update(inst_count, num_threads);
    if let Err(e) = history.save(&opts.sched_history_db()) {
        error!("failed to save scheduler history: {e}");
    }

    println!("{name}: {}", outcome.summary);
    if outcome.invariant_violated {
        println!("invariant violated under random scheduling");
    }
    ExitCode::SUCCESS
}

fn cmd_pct(name: &str, coop: bool, knobs: &Knobs) -> ExitCode {
    let opts = match validated_options(knobs) {
        Ok(o) => o,
        Err(code) => return code,
    };
    let scenario = match load_scenario(name) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let control = match make_control(coop, &opts) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let mut history = RunHistory::new();
    if opts.sched_history_db().exists() {
        if let Err(e) = history.load(&opts.sched_history_db()) {
            error!("failed to load scheduler history: {e}");
            return ExitCode::FAILURE;
        }
    }

    let ctrl = Arc::new(Controller::new(&opts));
    let sched = Arc::new(PctScheduler::new(&opts, control, &history, effective_seed(&opts)));
    ctrl.set_steering(Arc::clone(&sched) as Arc<dyn weft_core::exec::Steering>);

    let outcome = scenario.run(&ctrl);
    ctrl.program_exit();

    let (inst_count, num_threads) = sched.stats();
    history.update(inst_count, num_threads);
    if let Err(e) = history.save(&opts.sched_history_db()) {
        error!("failed to save scheduler history: {e}");
    }

    println!("{name}: {}", outcome.summary);
    if outcome.invariant_violated {
        println!("invariant violated under pct scheduling");
    }
    ExitCode::SUCCESS
}

fn cmd_memo(knobs: &Knobs) -> ExitCode {
    let opts = match validated_options(knobs) {
        Ok(o) => o,
        Err(code) => return code,
    };
    let ctrl = Arc::new(Controller::new(&opts));
    if let Err(e) = ctrl.load_databases() {
        error!("failed to load databases from {}: {e}", opts.db_dir.display());
        return ExitCode::FAILURE;
    }

    println!(
        "{} images, {} instructions",
        ctrl.registry().image_count(),
        ctrl.registry().inst_count()
    );
    println!(
        "{} iroot events, {} iroots",
        ctrl.iroot_db().event_count(),
        ctrl.iroot_db().iroot_count()
    );
    println!(
        "{} predicted, {} candidates",
        ctrl.memo().total_predicted(),
        ctrl.memo().total_candidates()
    );
    for iroot in ctrl.iroot_db().iroots() {
        let memo = ctrl.memo();
        let mark = if memo.is_exposed(&iroot) {
            "exposed"
        } else if memo.is_failed(&iroot) {
            "failed"
        } else if memo.is_candidate(&iroot) {
            "candidate"
        } else {
            "-"
        };
        println!("  {:<10} {}", mark, iroot.to_display_string());
    }
    ExitCode::SUCCESS
}
