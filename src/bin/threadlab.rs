use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{error, info, warn, LevelFilter};

use threadlab::lifecycle::{run_ticks, spin_until_stopped};
use threadlab::report;
use threadlab::{
    bounded_probe, ContentionScenario, LabConfig, LabError, LoadDriver, SecondLockMode, StopFlag,
    WorkerBuilder, WorkerGroup,
};

#[derive(Parser)]
#[command(name = "threadlab")]
#[command(about = "Race conditions, deadlocks and cooperative cancellation, side by side", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML file with lab parameters
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads for the load run
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Increment/decrement cycles per worker
    #[arg(long, global = true)]
    iterations: Option<u64>,

    /// Deadline for the bounded lock acquisition
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// How long the deadlock harness watches before calling a run stalled
    #[arg(long, global = true)]
    harness_wait_ms: Option<u64>,

    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare counter disciplines under concurrent load
    Race,
    /// Run the two-lock contention scenario
    Deadlock {
        /// Wait on the second lock without a deadline (stalls)
        #[arg(long, conflicts_with = "ordered")]
        unmitigated: bool,
        /// Take both locks in the same order
        #[arg(long)]
        ordered: bool,
    },
    /// Bounded acquisition against a lock held for `hold_ms`
    Probe {
        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,
    },
    /// Cooperative stop, priority hints, background workers, fault handling
    Lifecycle,
    /// Everything except the unmitigated deadlock
    All,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Info and up by default, --quiet keeps warnings and errors; RUST_LOG overrides
    let level = if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                report::log_line(record.level(), &record.args().to_string())
            )
        })
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), LabError> {
    let mut config = match &cli.config {
        Some(path) => LabConfig::load(path)?,
        None => LabConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.load.workers = workers;
    }
    if let Some(iterations) = cli.iterations {
        config.load.iterations = iterations;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.deadlock.timeout_ms = timeout_ms;
    }
    if let Some(harness_wait_ms) = cli.harness_wait_ms {
        config.deadlock.harness_wait_ms = harness_wait_ms;
    }
    config.validate()?;

    match cli.command {
        Commands::Race => race(&config),
        Commands::Deadlock {
            unmitigated,
            ordered,
        } => {
            let mode = if unmitigated {
                SecondLockMode::Unconditional
            } else if ordered {
                SecondLockMode::Ordered
            } else {
                SecondLockMode::Bounded(config.scenario_params().timeout)
            };
            deadlock(&config, mode)
        }
        Commands::Probe { hold_ms } => probe(&config, Duration::from_millis(hold_ms)),
        Commands::Lifecycle => lifecycle(&config),
        Commands::All => {
            race(&config)?;
            let timeout = config.scenario_params().timeout;
            deadlock(&config, SecondLockMode::Bounded(timeout))?;
            deadlock(&config, SecondLockMode::Ordered)?;
            lifecycle(&config)
        }
    }
}

fn race(config: &LabConfig) -> Result<(), LabError> {
    report::section("Counter disciplines");
    let driver = LoadDriver::new(config.load_params());
    for load in driver.compare(&config.load.disciplines)? {
        println!("{}", report::render_load(&load));
    }

    for &discipline in config.load.disciplines.iter().filter(|d| !d.is_synchronized()) {
        let deviated = driver.deviation_trials(discipline, config.load.trials)?;
        println!(
            "{} run(s) out of {} lost updates without synchronization",
            deviated.to_string().bold(),
            config.load.trials
        );
    }
    Ok(())
}

fn deadlock(config: &LabConfig, mode: SecondLockMode) -> Result<(), LabError> {
    report::section(&format!("Two locks, {mode}"));
    let scenario = ContentionScenario::new(config.scenario_params());
    let outcome = scenario.run(mode)?;
    println!("{}", report::render_scenario(&outcome));
    Ok(())
}

fn probe(config: &LabConfig, hold: Duration) -> Result<(), LabError> {
    report::section("Bounded acquisition");
    let probe = bounded_probe(hold, config.scenario_params().timeout)?;
    println!("{}", report::render_probe(&probe));
    Ok(())
}

fn lifecycle(config: &LabConfig) -> Result<(), LabError> {
    let section = &config.lifecycle;
    let period = Duration::from_millis(section.tick_ms);

    report::section("Cooperative stop");
    let stop = StopFlag::new();
    let flag = stop.clone();
    let ticks = section.ticks;
    let printer = WorkerBuilder::new("printer").spawn(move || {
        run_ticks(&flag, ticks, period, |i| info!("{i}"))
    })?;
    thread::sleep(Duration::from_millis(section.stop_after_ms));
    stop.request_stop();
    match printer.join() {
        Ok(outcome) => println!("{}", report::render_ticks("printer", &outcome)),
        Err(fault) => warn!("{fault}"),
    }

    report::section("Thread status");
    let mut group = WorkerGroup::new(StopFlag::new());
    let flag = group.stop_flag().clone();
    group.push(WorkerBuilder::new("printer").spawn(move || {
        run_ticks(&flag, 15, Duration::from_millis(50), |i| info!("{i}"));
    })?);
    group.push(WorkerBuilder::new("sleeper").spawn(|| thread::sleep(Duration::from_secs(2)))?);
    println!("{}", report::render_statuses(&group.statuses()));
    thread::sleep(Duration::from_secs(1));
    println!("{}", report::render_statuses(&group.statuses()));
    let outcome = group.join_foreground();
    for (name, result) in &outcome.joined {
        let status = if result.is_ok() { "Finished" } else { "Faulted" };
        println!("{name:<12} {status}");
    }

    report::section("Priority hints");
    println!("available cores: {}", num_cpus::get());
    let stop = StopFlag::new();
    let mut spinners = Vec::new();
    for (name, priority) in [
        ("Thread one", section.high_priority),
        ("Thread two", section.low_priority),
    ] {
        let flag = stop.clone();
        let worker = WorkerBuilder::new(name)
            .priority(priority)
            .affinity(section.affinity)
            .spawn(move || spin_until_stopped(&flag))?;
        spinners.push(worker);
    }
    thread::sleep(Duration::from_millis(section.spin_ms));
    stop.request_stop();
    for worker in spinners {
        let (name, priority) = (worker.name().to_string(), worker.priority());
        match worker.join() {
            Ok(count) => println!("{}", report::render_spin(&name, priority, count)),
            Err(fault) => warn!("{fault}"),
        }
    }

    report::section("Foreground and background");
    let mut group = WorkerGroup::new(StopFlag::new());
    for (name, ticks, background) in [("Foreground", 10, false), ("Background", 20, true)] {
        let flag = group.stop_flag().clone();
        let worker = WorkerBuilder::new(name)
            .background(background)
            .spawn(move || run_ticks(&flag, ticks, period, |i| info!("{i}")))?;
        group.push(worker);
    }
    let outcome = group.join_foreground();
    for (name, result) in &outcome.joined {
        match result {
            Ok(ticks) => println!("{}", report::render_ticks(name, ticks)),
            Err(fault) => warn!("{fault}"),
        }
    }
    for name in &outcome.detached {
        println!("{name} was asked to stop and left running");
    }

    report::section("Worker faults");
    let faulty = WorkerBuilder::new("faulty").spawn(move || {
        thread::sleep(period);
        panic!("Boom!");
    })?;
    if let Err(fault) = faulty.join() {
        println!("driver still alive after {}", fault);
    }
    Ok(())
}
