/// Telemetry aggregation and the live snapshot.
///
/// The aggregator folds per-SM and per-warp state into the system-level
/// figures a dashboard shows. It holds no state of its own: everything here
/// is recomputed from the latest chip and scheduler values.
///
/// The runtime writes a JSON snapshot to METRICS_PATH; any external viewer
/// can poll the file. Writes are atomic (write to .tmp then rename) to avoid
/// torn reads.
use crate::chip::{ChipState, Phase};
use crate::scheduler::{MigrationEvent, ThroughputSample, WarpScheduler};
use crate::sm::ComputeCore;
use crate::warp::{InstructionMix, Warp, WarpStatus};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const METRICS_PATH: &str = "/tmp/chipsim_live.json";

/// IPC proxy per workload percent while the chip is executing
const IPC_PER_LOAD: f64 = 2.5;

// ---------------------------------------------------------------------------
// Chip telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipTelemetry {
    /// Mean SM temperature in °C
    pub temperature_c: f64,
    pub clock_speed_ghz: f64,
    pub vram_usage_gb: f64,
    pub instructions_per_cycle: f64,
    pub balancing_events: u64,
}

impl ChipTelemetry {
    pub fn power_on() -> Self {
        ChipTelemetry {
            temperature_c: 42.0,
            clock_speed_ghz: 2.5,
            vram_usage_gb: 12.4,
            instructions_per_cycle: 0.0,
            balancing_events: 0,
        }
    }
}

/// Recompute chip telemetry after a global tick.
pub fn aggregate(prev: &ChipTelemetry, cores: &[ComputeCore], workload: f64, phase: Phase) -> ChipTelemetry {
    ChipTelemetry {
        temperature_c: mean_temperature(cores).unwrap_or(prev.temperature_c),
        instructions_per_cycle: if phase == Phase::Executing { workload * IPC_PER_LOAD } else { 0.0 },
        ..prev.clone()
    }
}

pub fn mean_temperature(cores: &[ComputeCore]) -> Option<f64> {
    if cores.is_empty() {
        return None;
    }
    Some(cores.iter().map(|c| c.temperature_c).sum::<f64>() / cores.len() as f64)
}

// ---------------------------------------------------------------------------
// Scheduler summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub cycle: u64,
    pub active_warp_id: usize,
    pub ready: usize,
    pub computing: usize,
    pub stalled: usize,
    pub migrating: usize,
    pub committing: usize,
    /// Mean completion latency in scheduler cycles
    pub mean_latency: Option<f64>,
    pub instructions_retired: u64,
    pub instruction_mix: InstructionMix,
    /// Mean active lanes per warp, out of 32
    pub mean_active_lanes: f64,
    /// Warps currently homed on each SM — index = SM id
    pub warps_per_core: Vec<usize>,
}

pub fn summarize(sched: &WarpScheduler) -> SchedulerSummary {
    let warps = &sched.warps;
    let count = |status: WarpStatus| warps.iter().filter(|w| w.status == status).count();

    let mut instruction_mix = InstructionMix::default();
    for w in warps {
        instruction_mix.add(&w.instruction_mix);
    }

    let mean_latency = if sched.latency_samples.is_empty() {
        None
    } else {
        Some(sched.latency_samples.iter().sum::<u64>() as f64 / sched.latency_samples.len() as f64)
    };

    let mean_active_lanes = if warps.is_empty() {
        0.0
    } else {
        warps.iter().map(Warp::active_lanes).sum::<usize>() as f64 / warps.len() as f64
    };

    let mut warps_per_core = vec![0usize; sched.num_cores()];
    for w in warps {
        if let Some(slot) = warps_per_core.get_mut(w.current_core_id) {
            *slot += 1;
        }
    }

    SchedulerSummary {
        cycle: sched.cycle,
        active_warp_id: sched.active_warp_id,
        ready: count(WarpStatus::Ready),
        computing: count(WarpStatus::Computing),
        stalled: count(WarpStatus::Stalled),
        migrating: count(WarpStatus::Migrating),
        committing: count(WarpStatus::Committing),
        mean_latency,
        instructions_retired: warps.iter().map(|w| w.instructions_executed).sum(),
        instruction_mix,
        mean_active_lanes,
        warps_per_core,
    }
}

// ---------------------------------------------------------------------------
// Live snapshot
// ---------------------------------------------------------------------------

/// Everything a viewer needs, read-only. Latest snapshot wins.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveMetrics {
    pub chip: ChipState,
    pub scheduler: SchedulerSummary,
    pub warps: Vec<Warp>,
    pub migration_log: Vec<MigrationEvent>,
    pub latency_samples: Vec<u64>,
    pub throughput_history: Vec<ThroughputSample>,
    pub migration_enabled: bool,
    /// Unix timestamp in ms when this snapshot was taken
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    pub fn capture(chip: &ChipState, sched: &WarpScheduler) -> Self {
        LiveMetrics {
            chip: chip.clone(),
            scheduler: summarize(sched),
            warps: sched.warps.clone(),
            migration_log: sched.migration_log.iter().cloned().collect(),
            latency_samples: sched.latency_samples.iter().copied().collect(),
            throughput_history: sched.throughput_history.iter().copied().collect(),
            migration_enabled: sched.migration_enabled,
            timestamp_ms: now_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write a snapshot to `path` via a .tmp sibling + rename.
pub fn write_metrics(path: &Path, metrics: &LiveMetrics) -> anyhow::Result<()> {
    let json = serde_json::to_string(metrics).context("serializing snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
