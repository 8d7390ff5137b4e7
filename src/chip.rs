/// Top-level accelerator state and its transition function.
///
/// The chip is modeled as an immutable value: every global tick and every
/// external command maps the previous `ChipState` to a new one. Nothing in
/// here holds timers or threads; the runtime decides when a tick happens.
///
/// Pipeline phase is derived from the cycle counter, never stored by hand:
///   cycle % 16 in [0, 4)   ORCHESTRATING
///                 [4, 8)   FETCHING
///                 [8, 12)  EXECUTING
///                 [12, 16) COMMITTING
/// and IDLE whenever the workload is zero.
use crate::catalog::{self, EnterpriseTask, KernelPatch, KernelProfile};
use crate::interconnect::{HostMetrics, PcieLink};
use crate::metrics::{self, ChipTelemetry};
use crate::sm::ComputeCore;
use log::{debug, info, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const PHASE_PERIOD: u64 = 16;
/// Workload below which the SMs are never considered busy
pub const BUSY_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Orchestrating,
    Fetching,
    Executing,
    Committing,
}

impl Phase {
    pub fn at(cycle: u64, workload: f64) -> Phase {
        if workload <= 0.0 {
            return Phase::Idle;
        }
        match cycle % PHASE_PERIOD {
            0..=3 => Phase::Orchestrating,
            4..=7 => Phase::Fetching,
            8..=11 => Phase::Executing,
            _ => Phase::Committing,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle          => write!(f, "IDLE"),
            Phase::Orchestrating => write!(f, "ORCHESTRATING"),
            Phase::Fetching      => write!(f, "FETCHING"),
            Phase::Executing     => write!(f, "EXECUTING"),
            Phase::Committing    => write!(f, "COMMITTING"),
        }
    }
}

/// A memory channel. Modeled for the snapshot; never loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChannel {
    pub id: usize,
    pub busy: bool,
    pub load: f64,
}

/// Commands the outside world can inject into the chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Start,
    Stop,
    /// Back to power-on state (not running); also resets the warp scheduler
    Reset,
    /// Reset only the warp scheduler
    ResetWarps,
    /// Global workload level, clamped to [0, 100]
    SetWorkload(f64),
    /// Select an enterprise task by id; sets workload to its load profile
    SelectTask(String),
    SelectKernel(KernelProfile),
    PatchKernel(KernelPatch),
    /// Re-copy the catalog entry for the active kernel's id
    RestoreKernel,
    ToggleBalancing,
    ToggleMigration,
    SetAdvisorMessage(Option<String>),
    /// Global tick period in milliseconds
    SetSpeed(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipState {
    pub cycle: u64,
    pub is_running: bool,
    /// Global tick period in milliseconds
    pub simulation_speed_ms: u64,
    /// Global workload level [0, 100]
    pub workload: f64,
    pub phase: Phase,
    pub pending_kernels: u32,
    pub active_grid_blocks: u32,
    pub cores: Vec<ComputeCore>,
    pub memory_channels: Vec<MemoryChannel>,
    pub pcie: PcieLink,
    pub host: HostMetrics,
    pub telemetry: ChipTelemetry,
    pub active_kernel: KernelProfile,
    pub active_task: Option<EnterpriseTask>,
    pub load_balancing_enabled: bool,
    pub advisor_message: Option<String>,
}

impl ChipState {
    pub fn new(num_cores: usize, num_host_cores: usize, num_memory_channels: usize, speed_ms: u64) -> Self {
        ChipState {
            cycle: 0,
            is_running: false,
            simulation_speed_ms: speed_ms.max(1),
            workload: 0.0,
            phase: Phase::Idle,
            pending_kernels: 0,
            active_grid_blocks: 0,
            cores: (0..num_cores).map(ComputeCore::new).collect(),
            memory_channels: (0..num_memory_channels)
                .map(|id| MemoryChannel { id, busy: false, load: 0.0 })
                .collect(),
            pcie: PcieLink::gen5_x16(),
            host: HostMetrics::new(num_host_cores),
            telemetry: ChipTelemetry::power_on(),
            active_kernel: catalog::default_kernel(),
            active_task: None,
            load_balancing_enabled: true,
            advisor_message: None,
        }
    }

    /// Advance chip-wide metrics by one global tick.
    /// The cycle counter moves even when there is no workload.
    pub fn tick<R: Rng>(&self, rng: &mut R) -> ChipState {
        let workload = self.workload;
        let phase = Phase::at(self.cycle, workload);

        let pending_kernels = if workload > 0.0 {
            (workload * 0.8 + rng.gen_range(0.0..5.0)).floor() as u32
        } else {
            0
        };
        let active_grid_blocks = if matches!(phase, Phase::Fetching | Phase::Executing) {
            (workload / 2.5 + rng.gen_range(0.0..3.0)).floor() as u32
        } else {
            0
        };

        let busy = workload > BUSY_THRESHOLD && phase == Phase::Executing;
        let cores: Vec<ComputeCore> = self
            .cores
            .iter()
            .map(|core| core.step(workload, busy, rng))
            .collect();

        let telemetry = metrics::aggregate(&self.telemetry, &cores, workload, phase);

        trace!(
            "chip cycle {}: phase={} pending={} blocks={} temp={:.1}",
            self.cycle, phase, pending_kernels, active_grid_blocks, telemetry.temperature_c
        );

        ChipState {
            cycle: self.cycle + 1,
            phase,
            pending_kernels,
            active_grid_blocks,
            cores,
            pcie: self.pcie.step(workload, phase),
            host: self.host.step(workload, phase, rng),
            telemetry,
            ..self.clone()
        }
    }

    /// Apply an external command. Scheduler-only commands leave the chip as is;
    /// the runtime routes them.
    pub fn apply(&self, command: &Command) -> ChipState {
        match command {
            Command::Start => {
                info!("simulation started at cycle {}", self.cycle);
                ChipState { is_running: true, ..self.clone() }
            }
            Command::Stop => {
                info!("simulation stopped at cycle {}", self.cycle);
                ChipState { is_running: false, phase: Phase::Idle, ..self.clone() }
            }
            Command::Reset => {
                info!("chip reset");
                ChipState::new(
                    self.cores.len(),
                    self.host.cpu_cores.len(),
                    self.memory_channels.len(),
                    self.simulation_speed_ms,
                )
            }
            Command::SetWorkload(level) => {
                let workload = if level.is_nan() { 0.0 } else { level.clamp(0.0, 100.0) };
                debug!("workload -> {:.0}%", workload);
                ChipState { workload, ..self.clone() }
            }
            Command::SelectTask(id) => match catalog::find_task(id) {
                Some(task) => {
                    info!("task '{}' selected ({} @ {}%)", task.name, task.category, task.load_profile);
                    ChipState {
                        workload: task.load_profile.min(100) as f64,
                        active_task: Some(task),
                        ..self.clone()
                    }
                }
                None => {
                    debug!("unknown task '{}' ignored", id);
                    self.clone()
                }
            },
            Command::SelectKernel(kernel) => {
                info!("kernel '{}' selected", kernel.id);
                ChipState {
                    active_kernel: kernel.with_clamped_fields(),
                    ..self.clone()
                }
            }
            Command::PatchKernel(patch) => ChipState {
                active_kernel: self.active_kernel.patched(patch),
                ..self.clone()
            },
            Command::RestoreKernel => match catalog::find_kernel(&self.active_kernel.id) {
                Some(original) => ChipState { active_kernel: original, ..self.clone() },
                None => self.clone(),
            },
            Command::ToggleBalancing => ChipState {
                load_balancing_enabled: !self.load_balancing_enabled,
                ..self.clone()
            },
            Command::SetAdvisorMessage(message) => ChipState {
                advisor_message: message.clone(),
                ..self.clone()
            },
            Command::SetSpeed(ms) => ChipState {
                simulation_speed_ms: (*ms).max(1),
                ..self.clone()
            },
            Command::ResetWarps | Command::ToggleMigration => self.clone(),
        }
    }

    pub fn throttled_cores(&self) -> usize {
        self.cores.iter().filter(|c| c.is_throttled).count()
    }
}

/// Whether an external advisor should be asked for fresh advice this cycle.
pub fn advisor_due(cycle: u64, is_running: bool) -> bool {
    is_running && cycle > 0 && cycle % 100 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn chip() -> ChipState {
        ChipState::new(8, 8, 6, 500)
    }

    #[test]
    fn phase_is_pure_function_of_cycle() {
        assert_eq!(Phase::at(0, 0.0), Phase::Idle);
        assert_eq!(Phase::at(9, 0.0), Phase::Idle);
        assert_eq!(Phase::at(0, 1.0), Phase::Orchestrating);
        assert_eq!(Phase::at(5, 50.0), Phase::Fetching);
        assert_eq!(Phase::at(11, 50.0), Phase::Executing);
        assert_eq!(Phase::at(15, 50.0), Phase::Committing);
        assert_eq!(Phase::at(16 * 7 + 4, 50.0), Phase::Fetching);
    }

    #[test]
    fn tick_advances_cycle_even_when_idle() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        let next = chip().tick(&mut rng);
        assert_eq!(next.cycle, 1);
        assert_eq!(next.phase, Phase::Idle);
        assert_eq!(next.pending_kernels, 0);
    }

    #[test]
    fn workload_is_clamped() {
        let s = chip().apply(&Command::SetWorkload(250.0));
        assert_eq!(s.workload, 100.0);
        let s = s.apply(&Command::SetWorkload(-3.0));
        assert_eq!(s.workload, 0.0);
    }

    #[test]
    fn task_selection_sets_workload() {
        let s = chip().apply(&Command::SelectTask("bus-stock".into()));
        assert_eq!(s.workload, 40.0);
        assert_eq!(s.active_task.as_ref().map(|t| t.id.as_str()), Some("bus-stock"));
        let s = s.apply(&Command::SelectTask("missing".into()));
        assert_eq!(s.active_task.as_ref().map(|t| t.id.as_str()), Some("bus-stock"));
    }

    #[test]
    fn kernel_patch_then_restore() {
        let s = chip().apply(&Command::PatchKernel(KernelPatch {
            stall_probability: Some(0.5),
            ..Default::default()
        }));
        assert_eq!(s.active_kernel.stall_probability, 0.5);
        assert_eq!(catalog::default_kernel().stall_probability, 0.02);
        let s = s.apply(&Command::RestoreKernel);
        assert_eq!(s.active_kernel, catalog::default_kernel());
    }

    #[test]
    fn select_kernel_clamps_and_flags_toggle() {
        let wild = KernelProfile {
            stall_probability: 3.0,
            compute_intensity: 40.0,
            memory_pressure: 0,
            ..catalog::default_kernel()
        };
        let s = chip().apply(&Command::SelectKernel(wild));
        assert_eq!(s.active_kernel.stall_probability, 1.0);
        assert_eq!(s.active_kernel.compute_intensity, 15.0);
        assert_eq!(s.active_kernel.memory_pressure, 1);

        assert!(s.load_balancing_enabled);
        let s = s.apply(&Command::ToggleBalancing);
        assert!(!s.load_balancing_enabled);
        let s = s.apply(&Command::ToggleBalancing);
        assert!(s.load_balancing_enabled);

        let s = s.apply(&Command::SetAdvisorMessage(Some("Lower the clock.".into())));
        assert_eq!(s.advisor_message.as_deref(), Some("Lower the clock."));
        let s = s.apply(&Command::SetAdvisorMessage(None));
        assert!(s.advisor_message.is_none());
    }

    #[test]
    fn stop_forces_idle_phase_and_reset_stops() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(2);
        let mut s = chip().apply(&Command::SetWorkload(80.0)).apply(&Command::Start);
        for _ in 0..6 {
            s = s.tick(&mut rng);
        }
        assert_eq!(s.phase, Phase::Fetching);
        let stopped = s.apply(&Command::Stop);
        assert!(!stopped.is_running);
        assert_eq!(stopped.phase, Phase::Idle);

        let reset = s.apply(&Command::Reset);
        assert!(!reset.is_running);
        assert_eq!(reset.cycle, 0);
        assert_eq!(reset.workload, 0.0);
        assert_eq!(reset.cores.len(), 8);
    }

    #[test]
    fn grid_blocks_only_while_fetching_or_executing() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(3);
        let mut s = chip().apply(&Command::SetWorkload(100.0));
        for _ in 0..64 {
            s = s.tick(&mut rng);
            match s.phase {
                Phase::Fetching | Phase::Executing => assert!(s.active_grid_blocks >= 40),
                _ => assert_eq!(s.active_grid_blocks, 0),
            }
            assert!(s.pending_kernels >= 80);
        }
    }

    #[test]
    fn advisor_cadence() {
        assert!(!advisor_due(0, true));
        assert!(advisor_due(200, true));
        assert!(!advisor_due(200, false));
        assert!(!advisor_due(201, true));
    }
}
