mod scenario;

use scenario::{Instrumentation, Scenario, StepFilter};
use tracepin_core::sim::{Execution, MAIN_TID, Protection};
use tracepin_core::{
    SessionDirectory, SessionHandle, SimulatedTarget, TracepinConfig, TracepinError, TrackerInfo,
    TrackerInfoKind,
};

use clap::Parser;
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    #[clap(short, long, value_parser)]
    scenario: PathBuf,
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Replace the scenario's steps with N random ones.
    #[clap(long)]
    random_steps: Option<usize>,
    /// Print the surviving trackers as JSON at the end.
    #[clap(long)]
    json: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<TracepinConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            Ok(TracepinConfig::load_from_file(&path)?)
        }
        None => {
            let default_path = PathBuf::from("tracepin.toml");
            if default_path.exists() {
                info!("No config file specified, loading default: {default_path:?}");
                Ok(TracepinConfig::load_from_file(&default_path)?)
            } else {
                Ok(TracepinConfig::default())
            }
        }
    }
}

fn spawn_target(scenario: &Scenario) -> anyhow::Result<SimulatedTarget> {
    let sim = SimulatedTarget::new();
    sim.spawn(scenario.pid);
    for (base, size) in scenario.code_ranges() {
        sim.map(scenario.pid, base, size, Protection::ReadExecute)?;
        sim.poke(scenario.pid, base, &scenario.code_bytes(base, size))?;
    }
    Ok(sim)
}

fn print_trackers(step: usize, trackers: &[TrackerInfo]) {
    println!("Step {step}: {} trackers", trackers.len());
    for t in trackers {
        let kind = match &t.kind {
            TrackerInfoKind::Breakpoint { .. } => "breakpoint".to_string(),
            TrackerInfoKind::Hook {
                trampoline, form, ..
            } => format!("hook ({form:?} via {trampoline:#x})"),
        };
        println!(
            "  {:#014x}  {:<32}  enabled={:<5}  hit={}",
            t.address, kind, t.enabled, t.hit
        );
    }
}

fn run_step(
    dir: &SessionDirectory,
    handle: SessionHandle,
    sim: &SimulatedTarget,
    pid: u32,
    step: &scenario::Step,
) -> anyhow::Result<usize> {
    match dir.enable_all(handle) {
        Ok(()) | Err(TracepinError::NoActiveDebugger) => {}
        Err(e) => return Err(e.into()),
    }
    dir.step_begin(handle)?;
    for &address in &step.executed {
        match sim.execute(pid, MAIN_TID, address)? {
            Execution::Crashed => anyhow::bail!("Target crashed executing {address:#x}"),
            outcome => log::debug!("Executed {address:#x}: {outcome:?}"),
        }
    }
    dir.step_end(handle)?;
    let removed = match step.filter {
        Some(StepFilter::Executed) => dir.filter_executed(handle)?,
        Some(StepFilter::NotExecuted) => dir.filter_not_executed(handle)?,
        None => 0,
    };
    Ok(removed)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = load_config(cli.config)?;
    let mut scenario = Scenario::load_from_file(&cli.scenario)?;
    if let Some(count) = cli.random_steps {
        let mut rng = ChaCha8Rng::seed_from_u64(cli.seed);
        scenario.randomize_steps(&mut rng, count);
        info!("Generated {count} random steps from seed {}", cli.seed);
    }

    let sim = spawn_target(&scenario)?;
    let dir = SessionDirectory::new(Arc::new(sim.clone()), config);
    let handle = dir.create()?;
    dir.set_target(handle, scenario.pid)?;

    for f in &scenario.functions {
        let added = match f.instrumentation {
            Instrumentation::Breakpoint => dir.add_breakpoint(handle, f.address),
            Instrumentation::Hook => dir.add_hook(handle, f.address, f.len),
        };
        if let Err(e) = added {
            warn!("Skipping function at {:#x}: {e} (status {})", f.address, e.status().code());
        }
    }
    if scenario.has_breakpoints() {
        dir.debug_loop_start(handle)?;
    }

    let start_time = Instant::now();
    for (i, step) in scenario.steps.iter().enumerate() {
        let removed = run_step(&dir, handle, &sim, scenario.pid, step)?;
        info!("Step {i} removed {removed} trackers");
        if !cli.json {
            print_trackers(i, &dir.trackers(handle)?);
        }
    }
    info!(
        "Ran {} steps in {:.2?}",
        scenario.steps.len(),
        start_time.elapsed()
    );

    let survivors = dir.trackers(handle)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&survivors)?);
    }
    dir.shutdown()?;
    Ok(())
}
