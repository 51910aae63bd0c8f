use anyhow::Context;
use clap::Parser;

use gridsched::load_system;
use gridsched::state::job::JobState;

/// Cluster workload scheduler core: load a cluster description and run
/// scheduling cycles over it.
#[derive(Parser, Debug)]
#[command(name = "gridsched", version, about)]
struct Args {
    /// Path to the cluster description JSON file.
    cluster_file: String,

    /// Number of scheduling cycles to run.
    #[arg(long, default_value_t = 1)]
    cycles: u32,

    /// Per-cycle job limit (0 = use default_queue_depth).
    #[arg(long, default_value_t = 0)]
    job_limit: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut system = load_system(&args.cluster_file).with_context(|| format!("loading cluster file '{}'", args.cluster_file))?;
    system.start_gang();

    let mut started_total = 0;
    for cycle in 1..=args.cycles {
        let started = system.scheduler.schedule(args.job_limit);
        started_total += started;
        log::info!("cycle {}: started {} jobs", cycle, started);
    }

    {
        let jobs = system.state.jobs.read().expect("job lock poisoned");
        let mut running = 0;
        let mut pending = 0;
        let mut other = 0;
        for (_, job) in jobs.iter() {
            match job.state {
                JobState::Running => running += 1,
                JobState::Pending => pending += 1,
                _ => other += 1,
            }
        }
        println!("jobs started: {}", started_total);
        println!("running: {}  pending: {}  other: {}", running, pending, other);
        for (id, job) in jobs.iter() {
            println!("  job {:>6}  {:?}  reason={:?}  nodes={:?}", id, job.state, job.reason, job.alloc.as_ref().map(|a| a.node_count()));
        }
    }

    system.shutdown();
    Ok(())
}
