use anyhow::Context;
use chipsim::catalog::{default_kernel, find_kernel};
use chipsim::chip::{ChipState, Command};
use chipsim::config::SimConfig;
use chipsim::metrics::{summarize, write_metrics, SchedulerSummary, METRICS_PATH};
use chipsim::runtime::{RealtimeDriver, Simulator};
use log::{info, warn};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Snapshot refresh rate for external viewers
const FRAME: Duration = Duration::from_millis(200);

fn env_override<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {}={:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

/// One-line progress report for the console.
fn status_line(chip: &ChipState, sched: &SchedulerSummary) -> String {
    format!(
        "[chipsim] cycle {:>4} {:<13} load={:>3.0}% temp={:>5.1}C throttled={} | warps: ready {} stalled {} migrating {} | retired={} mean_lat={}",
        chip.cycle,
        chip.phase.to_string(),
        chip.workload,
        chip.telemetry.temperature_c,
        chip.throttled_cores(),
        sched.ready,
        sched.stalled,
        sched.migrating,
        sched.instructions_retired,
        sched
            .mean_latency
            .map(|l| format!("{:.1}", l))
            .unwrap_or_else(|| "-".to_string()),
    )
}

/// Wait for the scripted operator. Returns false if it panicked.
fn join_operator(operator: thread::JoinHandle<()>) -> bool {
    match operator.join() {
        Ok(()) => true,
        Err(_) => {
            warn!("operator thread panicked; scripted commands may be incomplete");
            false
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = SimConfig::default();
    if let Some(speed) = env_override("CHIPSIM_SPEED_MS")? {
        config.speed_ms = speed;
    }
    if let Some(seed) = env_override("CHIPSIM_SEED")? {
        config.seed = Some(seed);
    }
    let run_secs: u64 = env_override("CHIPSIM_RUN_SECS")?.unwrap_or(20);
    let task: String = env_override("CHIPSIM_TASK")?.unwrap_or_else(|| "ai-train".to_string());

    let mut sim = Simulator::new(config);
    sim.send(Command::SelectTask(task.clone()));
    if sim.chip().active_task.is_none() {
        anyhow::bail!("unknown task '{}'", task);
    }
    sim.send(Command::Start);

    // Scripted operator: exercises the command interface while the clocks run
    let (tx, rx) = mpsc::channel();
    let operator = thread::spawn(move || {
        let script = [
            (run_secs * 1000 / 4, Command::SelectKernel(find_kernel("raytrace").unwrap_or_else(default_kernel))),
            (run_secs * 1000 / 2, Command::SelectTask("bus-stock".to_string())),
            (run_secs * 1000 * 3 / 4, Command::ToggleMigration),
        ];
        let mut elapsed = 0;
        for (at_ms, command) in script {
            thread::sleep(Duration::from_millis(at_ms - elapsed));
            elapsed = at_ms;
            if tx.send(command).is_err() {
                break;
            }
        }
    });

    let path = Path::new(METRICS_PATH);
    let mut frames = 0u64;
    let mut driver = RealtimeDriver::new(sim, rx, FRAME);
    driver.run_for(Duration::from_secs(run_secs), |sim| {
        if let Err(err) = write_metrics(path, &sim.snapshot()) {
            warn!("snapshot not written: {:#}", err);
        }
        if sim.take_advisor_request() {
            info!("advisor window open at cycle {}", sim.chip().cycle);
        }

        frames += 1;
        if frames % 5 == 0 {
            println!("{}", status_line(sim.chip(), &summarize(sim.scheduler())));
        }
    });

    join_operator(operator);
    let sim = driver.into_simulator();
    write_metrics(path, &sim.snapshot()).context("writing final snapshot")?;
    info!(
        "done: {} global cycles, {} scheduler cycles, {} completions sampled",
        sim.chip().cycle,
        sim.scheduler().cycle,
        sim.scheduler().latency_samples.len(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chipsim::scheduler::WarpScheduler;

    #[test]
    fn status_line_reports_counts() {
        let chip = ChipState::new(8, 8, 6, 500).apply(&Command::SetWorkload(40.0));
        let mut sched = summarize(&WarpScheduler::new(12, 8));
        sched.stalled = 2;
        sched.migrating = 1;
        sched.ready = 9;
        let line = status_line(&chip, &sched);
        assert!(line.starts_with("[chipsim] cycle    0 IDLE"));
        assert!(line.contains("load= 40%"));
        assert!(line.contains("| warps: ready 9 stalled 2 migrating 1 |"));
        assert!(line.ends_with("retired=0 mean_lat=-"));
    }

    #[test]
    fn operator_panic_is_reported_not_propagated() {
        assert!(join_operator(thread::spawn(|| {})));
        assert!(!join_operator(thread::spawn(|| panic!("script aborted"))));
    }
}
