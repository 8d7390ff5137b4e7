/// Warp execution contexts.
/// A warp is a group of 32 lanes scheduled as a unit onto one SM. The
/// simulator does not execute instructions; a warp only tracks progress,
/// which SM hosts it, and what its lanes have been doing.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const WARP_SIZE: usize = 32; // Standard CUDA warp size
/// How many SM ids a warp remembers, current one included
pub const CORE_HISTORY_LEN: usize = 6;
/// Length of the per-warp status trace
pub const STATUS_TRACE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarpStatus {
    /// Eligible for dispatch
    Ready,
    /// Holds the dispatch slot and is retiring instructions
    Computing,
    /// Waiting on a memory access
    Stalled,
    /// Moving to another SM
    Migrating,
    /// Finished; waiting to be recycled
    Committing,
    /// Placeholder in the status trace before the warp was observed
    Idle,
}

impl std::fmt::Display for WarpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarpStatus::Ready      => write!(f, "READY"),
            WarpStatus::Computing  => write!(f, "COMPUTING"),
            WarpStatus::Stalled    => write!(f, "STALLED"),
            WarpStatus::Migrating  => write!(f, "MIGRATING"),
            WarpStatus::Committing => write!(f, "COMMITTING"),
            WarpStatus::Idle       => write!(f, "IDLE"),
        }
    }
}

/// Retired instruction counts by pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionMix {
    pub alu: u64,
    pub mem: u64,
    pub ctrl: u64,
}

impl InstructionMix {
    /// Classify one retired instruction: 70% ALU, 20% MEM, 10% CTRL.
    pub fn retire<R: Rng>(&mut self, rng: &mut R) {
        let roll = rng.gen_range(0.0..100.0);
        if roll < 70.0 {
            self.alu += 1;
        } else if roll < 90.0 {
            self.mem += 1;
        } else {
            self.ctrl += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.alu + self.mem + self.ctrl
    }

    pub fn add(&mut self, other: &InstructionMix) {
        self.alu += other.alu;
        self.mem += other.mem;
        self.ctrl += other.ctrl;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warp {
    pub id: usize,
    pub status: WarpStatus,
    /// Completion percentage [0, 100]
    pub progress: f64,
    pub stall_cycles: u64,
    pub instructions_executed: u64,
    pub current_core_id: usize,
    pub last_core_id: Option<usize>,
    /// Most recent SMs this warp lived on, oldest first, current last
    pub core_history: VecDeque<usize>,
    pub migration_latency: u32,
    pub stall_timer: u32,
    pub stall_reason: Option<String>,
    pub start_cycle: Option<u64>,
    pub end_cycle: Option<u64>,
    pub instruction_mix: InstructionMix,
    /// Lane activity flags; always WARP_SIZE entries
    pub divergence_mask: [bool; WARP_SIZE],
    /// Status at each of the last STATUS_TRACE_LEN scheduler ticks, oldest first
    pub status_trace: VecDeque<WarpStatus>,
}

impl Warp {
    /// A fresh warp, homed on SM `id % num_cores`.
    pub fn new(id: usize, num_cores: usize) -> Self {
        let home = id % num_cores.max(1);
        Warp {
            id,
            status: WarpStatus::Ready,
            progress: 0.0,
            stall_cycles: 0,
            instructions_executed: 0,
            current_core_id: home,
            last_core_id: None,
            core_history: VecDeque::from([home]),
            migration_latency: 0,
            stall_timer: 0,
            stall_reason: None,
            start_cycle: None,
            end_cycle: None,
            instruction_mix: InstructionMix::default(),
            divergence_mask: [true; WARP_SIZE],
            status_trace: std::iter::repeat(WarpStatus::Idle).take(STATUS_TRACE_LEN).collect(),
        }
    }

    pub fn active_lanes(&self) -> usize {
        self.divergence_mask.iter().filter(|&&lane| lane).count()
    }

    /// Re-roll every lane: a lane stays active when U(0,1) > `mask_chance`.
    pub fn reroll_divergence<R: Rng>(&mut self, mask_chance: f64, rng: &mut R) {
        for lane in self.divergence_mask.iter_mut() {
            *lane = rng.gen_range(0.0..1.0) > mask_chance;
        }
    }

    /// Rehome on `core`, remembering where the warp came from.
    pub fn move_to(&mut self, core: usize) {
        self.last_core_id = Some(self.current_core_id);
        self.current_core_id = core;
        self.core_history.push_back(core);
        while self.core_history.len() > CORE_HISTORY_LEN {
            self.core_history.pop_front();
        }
    }

    pub fn record_status(&mut self) {
        self.status_trace.pop_front();
        self.status_trace.push_back(self.status);
    }

    /// Return a committed warp to the ready pool for its next launch.
    pub fn recycle(&mut self) {
        self.status = WarpStatus::Ready;
        self.progress = 0.0;
        self.start_cycle = None;
        self.divergence_mask = [true; WARP_SIZE];
    }
}
