/// Simulation runtime: the clocks that drive the chip and the warp scheduler.
///
/// Three timer sources share one millisecond timeline:
///   - the global tick, every `speed_ms`, advancing `ChipState`
///   - the scheduler tick, every `scheduler_period_ms`, advancing `WarpScheduler`
///   - one-shot recycles, `recycle_delay_ms` after a warp commits
///
/// The two periodic clocks are not synchronized with each other. The only
/// thing the scheduler reads from the chip is a copy of the active kernel
/// profile taken at its own tick, so the observable system is the
/// interleaving of two independent clocks. Ticks run to completion one at a
/// time; nothing here is preemptive or parallel.
///
/// Stopping disarms both periodic clocks; starting again re-arms them a full
/// period from the current time rather than resuming the old phase.
use crate::chip::{self, ChipState, Command};
use crate::config::SimConfig;
use crate::metrics::LiveMetrics;
use crate::scheduler::WarpScheduler;
use log::{debug, info, trace};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// A deferred recycle: warp `warp_id` returns to READY at `due_ms` unless the
/// scheduler has been reset since `epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingRecycle {
    due_ms: u64,
    warp_id: usize,
    epoch: u64,
}

/// Counts of what fired during one `advance_to` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceReport {
    pub chip_ticks: u64,
    pub scheduler_ticks: u64,
    pub completions: u64,
    pub recycles: u64,
}

pub struct Simulator {
    config: SimConfig,
    chip: ChipState,
    scheduler: WarpScheduler,
    rng: Xoshiro256StarStar,
    now_ms: u64,
    next_chip_tick: Option<u64>,
    next_scheduler_tick: Option<u64>,
    recycles: BinaryHeap<Reverse<PendingRecycle>>,
    advisor_requested: bool,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Xoshiro256StarStar::seed_from_u64(seed),
            None => Xoshiro256StarStar::from_entropy(),
        };
        let chip = ChipState::new(
            config.num_cores,
            config.num_host_cores,
            config.num_memory_channels,
            config.speed_ms,
        );
        let scheduler = WarpScheduler::new(config.num_warps, config.num_cores);
        info!(
            "chipsim: {} SMs, {} warps, global tick {}ms, scheduler tick {}ms",
            config.num_cores, config.num_warps, config.speed_ms, config.scheduler_period_ms
        );

        Simulator {
            config,
            chip,
            scheduler,
            rng,
            now_ms: 0,
            next_chip_tick: None,
            next_scheduler_tick: None,
            recycles: BinaryHeap::new(),
            advisor_requested: false,
        }
    }

    pub fn chip(&self) -> &ChipState {
        &self.chip
    }

    pub fn scheduler(&self) -> &WarpScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn snapshot(&self) -> LiveMetrics {
        LiveMetrics::capture(&self.chip, &self.scheduler)
    }

    /// True once per advisor cadence point; clears the request.
    pub fn take_advisor_request(&mut self) -> bool {
        std::mem::take(&mut self.advisor_requested)
    }

    /// Apply an external command to the chip and/or the scheduler, and
    /// re-arm or disarm the clocks accordingly.
    pub fn send(&mut self, command: Command) {
        let was_running = self.chip.is_running;
        self.chip = self.chip.apply(&command);

        match command {
            Command::Reset | Command::ResetWarps => {
                self.scheduler.reset();
                self.recycles.clear();
            }
            Command::ToggleMigration => {
                self.scheduler.migration_enabled = !self.scheduler.migration_enabled;
                info!("warp migration {}", if self.scheduler.migration_enabled { "enabled" } else { "disabled" });
            }
            Command::SetSpeed(_) if self.chip.is_running => {
                self.next_chip_tick = Some(self.now_ms + self.chip.simulation_speed_ms);
            }
            _ => {}
        }

        match (was_running, self.chip.is_running) {
            (false, true) => self.arm_clocks(),
            (true, false) => self.disarm_clocks(),
            _ => {}
        }
    }

    fn arm_clocks(&mut self) {
        self.next_chip_tick = Some(self.now_ms + self.chip.simulation_speed_ms);
        self.next_scheduler_tick = Some(self.now_ms + self.config.scheduler_period_ms.max(1));
    }

    fn disarm_clocks(&mut self) {
        self.next_chip_tick = None;
        self.next_scheduler_tick = None;
    }

    /// Earliest time anything is due, if anything is armed.
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.next_chip_tick,
            self.next_scheduler_tick,
            self.recycles.peek().map(|Reverse(r)| r.due_ms),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due at or before `target_ms`, in time order, then
    /// move the clock to `target_ms`. At equal times recycles fire first,
    /// then the global tick, then the scheduler tick.
    pub fn advance_to(&mut self, target_ms: u64) -> AdvanceReport {
        let mut report = AdvanceReport::default();

        while let Some(due) = self.next_deadline().filter(|&t| t <= target_ms) {
            self.now_ms = due;

            if let Some(Reverse(r)) = self.recycles.peek().copied().filter(|Reverse(r)| r.due_ms == due) {
                self.recycles.pop();
                if self.scheduler.recycle(r.warp_id, r.epoch) {
                    report.recycles += 1;
                }
                continue;
            }

            if self.next_chip_tick == Some(due) {
                self.chip = self.chip.tick(&mut self.rng);
                report.chip_ticks += 1;
                if chip::advisor_due(self.chip.cycle, self.chip.is_running) {
                    debug!("advisor due at cycle {}", self.chip.cycle);
                    self.advisor_requested = true;
                }
                self.next_chip_tick = Some(due + self.chip.simulation_speed_ms);
                continue;
            }

            if self.next_scheduler_tick == Some(due) {
                let kernel = self.chip.active_kernel.clone();
                let outcome = self.scheduler.tick(&kernel, &mut self.rng);
                report.scheduler_ticks += 1;
                let epoch = self.scheduler.epoch();
                for warp_id in outcome.completed {
                    report.completions += 1;
                    self.recycles.push(Reverse(PendingRecycle {
                        due_ms: due + self.config.recycle_delay_ms,
                        warp_id,
                        epoch,
                    }));
                }
                self.next_scheduler_tick = Some(due + self.config.scheduler_period_ms.max(1));
            }
        }

        self.now_ms = self.now_ms.max(target_ms);
        trace!("advanced to {}ms: {:?}", self.now_ms, report);
        report
    }

    /// Advance the clock by `delta_ms`.
    pub fn advance_by(&mut self, delta_ms: u64) -> AdvanceReport {
        self.advance_to(self.now_ms + delta_ms)
    }
}

// ---------------------------------------------------------------------------
// Real-time driver
// ---------------------------------------------------------------------------

/// Runs a `Simulator` against the wall clock, one simulated millisecond per
/// real one. Commands arrive over a channel and are applied between ticks.
pub struct RealtimeDriver {
    sim: Simulator,
    commands: Receiver<Command>,
    /// How often `on_frame` is called
    frame: Duration,
}

impl RealtimeDriver {
    pub fn new(sim: Simulator, commands: Receiver<Command>, frame: Duration) -> Self {
        RealtimeDriver { sim, commands, frame }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.sim
    }

    pub fn into_simulator(self) -> Simulator {
        self.sim
    }

    /// Drive the simulation for `duration` of wall time, calling `on_frame`
    /// with the current state every frame period.
    pub fn run_for<F>(&mut self, duration: Duration, mut on_frame: F)
    where
        F: FnMut(&mut Simulator),
    {
        let origin = Instant::now();
        let base_ms = self.sim.now_ms();
        let end = duration.as_millis() as u64;
        let frame_ms = (self.frame.as_millis() as u64).max(1);
        let mut next_frame = frame_ms;
        let mut channel_open = true;

        loop {
            let elapsed = origin.elapsed().as_millis() as u64;
            self.sim.advance_to(base_ms + elapsed.min(end));

            if elapsed >= next_frame {
                on_frame(&mut self.sim);
                next_frame += frame_ms * ((elapsed - next_frame) / frame_ms + 1);
            }
            if elapsed >= end {
                break;
            }

            let wake = self
                .sim
                .next_deadline()
                .map(|t| t.saturating_sub(base_ms))
                .unwrap_or(end)
                .min(next_frame)
                .min(end);
            let wait = Duration::from_millis(wake.saturating_sub(elapsed));

            if channel_open {
                match self.commands.recv_timeout(wait) {
                    Ok(command) => {
                        debug!("command: {:?}", command);
                        self.sim.send(command);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => channel_open = false,
                }
            } else {
                std::thread::sleep(wait);
            }
        }
    }
}
