//! Logging for the scheduler daemon.
//!
//! Everything the core reports (cycle verdicts, gang suspend/resume
//! transitions, license accounting errors) flows through the `log`
//! facade; `init` wires the facade to stderr and, when `GRIDSCHED_LOG`
//! names a file, to that file as well. Cycle diagnostics are emitted
//! through [`cycle_summary`] so every scheduling pass leaves exactly one
//! greppable `key=value` line under the `gridsched::cycle` target.

use chrono::Local;
use fern::colors::ColoredLevelConfig;
use fern::Dispatch;
use log::LevelFilter;
use std::sync::Once;

use crate::sched::scheduler::SchedStats;

static INIT: Once = Once::new();

/// Install the global logger once; later calls are no-ops.
///
/// The level comes from `RUST_LOG` (default `info`). `GRIDSCHED_LOG`
/// optionally names a log file that receives the same stream without
/// colors; a bad path is reported on stderr and logging continues on
/// stderr alone.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = install() {
            eprintln!("Failed to install logger: {}", e);
        }
    });
}

fn install() -> Result<(), fern::InitError> {
    let level = std::env::var("RUST_LOG").ok().and_then(|s| s.parse::<LevelFilter>().ok()).unwrap_or(LevelFilter::Info);
    let colors = ColoredLevelConfig::default();

    let console = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {} | {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    let mut dispatch = Dispatch::new().level(level).level_for("serde", LevelFilter::Warn).chain(console);

    if let Ok(path) = std::env::var("GRIDSCHED_LOG") {
        dispatch = dispatch.chain(
            Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} {:<5} {} | {}",
                        Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .chain(fern::log_file(&path)?),
        );
    }

    dispatch.apply()?;
    Ok(())
}

/// One line per scheduler cycle with the counters an operator asks for
/// first: how deep the pass went and how many jobs it started.
pub fn cycle_summary(stats: &SchedStats, depth: u32, started: usize) {
    log::info!(
        target: "gridsched::cycle",
        "cycle={} queue_len={} depth={} started={} total_started={}",
        stats.cycles,
        stats.last_queue_len,
        depth,
        started,
        stats.jobs_started
    );
}
