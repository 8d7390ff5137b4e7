/// Warp scheduler and migration engine.
///
/// A fixed pool of warps shares a single dispatch slot. Every scheduler tick:
///   1. each warp's sub-state machine advances (migration countdown, stall
///      countdown, random migration to another SM),
///   2. the warp holding the dispatch slot either stalls on a cache miss or
///      retires one instruction,
///   3. when the slot holder stalls, finishes, or is no longer runnable, the
///      slot goes to the first READY warp by id.
///
/// The dispatch policy is non-preemptive scan-for-first-ready: the holder
/// keeps the slot until it leaves the READY/COMPUTING states, and only one
/// warp advances per tick regardless of how many are READY.
///
/// Finished warps sit in COMMITTING until the runtime recycles them after a
/// fixed delay on its own timer; recycles carry the epoch they were scheduled
/// in so a reset invalidates every recycle still in flight.
use crate::catalog::KernelProfile;
use crate::warp::{Warp, WarpStatus};
use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Chance per tick that a READY warp is moved to another SM
pub const MIGRATION_PROBABILITY: f64 = 0.008;
/// Scheduler ticks a migrating warp spends in flight
pub const MIGRATION_COST: u32 = 12;
/// Scheduler ticks a cache miss keeps a warp stalled
pub const MEMORY_LATENCY: u32 = 15;
/// Warps only stall while progress is strictly inside (0, STALL_WINDOW)
pub const STALL_WINDOW: f64 = 90.0;
pub const STALL_REASON_CACHE_MISS: &str = "Cache Miss";

pub const MIGRATION_LOG_LEN: usize = 5;
pub const LATENCY_SAMPLES_LEN: usize = 100;
pub const THROUGHPUT_HISTORY_LEN: usize = 30;
/// Throughput is sampled on scheduler cycles divisible by this
pub const THROUGHPUT_INTERVAL: u64 = 10;

/// Observational record of one warp migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub id: u64,
    pub warp_id: usize,
    pub from: usize,
    pub to: usize,
    pub latency_cycles: u32,
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub cycle: u64,
    pub completed: usize,
}

/// What a tick produced that the caller has to act on.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    /// Warps that finished this tick and now await a deferred recycle
    pub completed: Vec<usize>,
}

/// Uniform draw against `p`. Out-of-range or NaN probabilities just never
/// (or always) fire instead of panicking like `gen_bool`.
pub(crate) fn chance<R: Rng>(rng: &mut R, p: f64) -> bool {
    rng.gen_range(0.0..1.0) < p
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpScheduler {
    pub warps: Vec<Warp>,
    /// Index of the warp holding the dispatch slot
    pub active_warp_id: usize,
    /// Scheduler-local cycle counter, independent of the chip cycle
    pub cycle: u64,
    pub migration_enabled: bool,
    /// Most recent migrations, newest first
    pub migration_log: VecDeque<MigrationEvent>,
    /// Completion latencies in scheduler cycles, oldest first
    pub latency_samples: VecDeque<u64>,
    pub throughput_history: VecDeque<ThroughputSample>,
    num_cores: usize,
    /// Bumped on every reset; stale recycles compare against it
    epoch: u64,
    next_event_id: u64,
}

impl WarpScheduler {
    pub fn new(num_warps: usize, num_cores: usize) -> Self {
        WarpScheduler {
            warps: (0..num_warps).map(|id| Warp::new(id, num_cores)).collect(),
            active_warp_id: 0,
            cycle: 0,
            migration_enabled: true,
            migration_log: VecDeque::with_capacity(MIGRATION_LOG_LEN),
            latency_samples: VecDeque::with_capacity(LATENCY_SAMPLES_LEN),
            throughput_history: VecDeque::with_capacity(THROUGHPUT_HISTORY_LEN),
            num_cores: num_cores.max(1),
            epoch: 0,
            next_event_id: 0,
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn active_warp(&self) -> Option<&Warp> {
        self.warps.get(self.active_warp_id)
    }

    /// Reinitialize every warp and clear all logs. Migration enablement is kept.
    pub fn reset(&mut self) {
        let num_warps = self.warps.len();
        self.warps = (0..num_warps).map(|id| Warp::new(id, self.num_cores)).collect();
        self.active_warp_id = 0;
        self.cycle = 0;
        self.migration_log.clear();
        self.latency_samples.clear();
        self.throughput_history.clear();
        self.epoch += 1;
        debug!("warp scheduler reset (epoch {})", self.epoch);
    }

    /// Deferred half of completion: return a committed warp to the ready pool.
    /// Ignored when the recycle was scheduled before the last reset or the
    /// warp is no longer committing.
    pub fn recycle(&mut self, warp_id: usize, epoch: u64) -> bool {
        if epoch != self.epoch {
            trace!("dropping stale recycle of W{:02} (epoch {} != {})", warp_id, epoch, self.epoch);
            return false;
        }
        match self.warps.get_mut(warp_id) {
            Some(w) if w.status == WarpStatus::Committing => {
                w.recycle();
                true
            }
            _ => false,
        }
    }

    /// Advance the warp population by one scheduler tick.
    pub fn tick<R: Rng>(&mut self, kernel: &KernelProfile, rng: &mut R) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for idx in 0..self.warps.len() {
            self.advance_warp(idx, rng);
        }

        let runnable = self
            .active_warp()
            .is_some_and(|w| matches!(w.status, WarpStatus::Computing | WarpStatus::Ready));
        if runnable {
            self.issue(kernel, &mut outcome, rng);
        } else {
            self.dispatch_next();
        }

        if self.cycle % THROUGHPUT_INTERVAL == 0 {
            if self.throughput_history.len() == THROUGHPUT_HISTORY_LEN {
                self.throughput_history.pop_front();
            }
            self.throughput_history.push_back(ThroughputSample {
                cycle: self.cycle,
                completed: outcome.completed.len(),
            });
        }

        trace!(
            "sched cycle {}: active=W{:02} completed={}",
            self.cycle,
            self.active_warp_id,
            outcome.completed.len()
        );
        self.cycle += 1;
        outcome
    }

    /// Per-warp bookkeeping that runs whether or not the warp holds the slot.
    fn advance_warp<R: Rng>(&mut self, idx: usize, rng: &mut R) {
        let cycle = self.cycle;
        let migration_enabled = self.migration_enabled;
        let num_cores = self.num_cores;
        let w = &mut self.warps[idx];

        if w.status == WarpStatus::Ready && w.progress == 0.0 && w.start_cycle.is_none() {
            w.start_cycle = Some(cycle);
        }

        if w.status == WarpStatus::Migrating {
            w.migration_latency = w.migration_latency.saturating_sub(1);
            if w.migration_latency == 0 {
                w.status = WarpStatus::Ready;
            }
        }

        if w.status == WarpStatus::Stalled {
            w.stall_cycles += 1;
            if w.stall_timer > 0 {
                w.stall_timer -= 1;
                if w.stall_timer == 0 {
                    w.status = WarpStatus::Ready;
                    w.stall_reason = None;
                }
            }
        }

        let mut migrated = None;
        if migration_enabled && w.status == WarpStatus::Ready && chance(rng, MIGRATION_PROBABILITY) {
            let target = rng.gen_range(0..num_cores);
            if target != w.current_core_id {
                let from = w.current_core_id;
                w.move_to(target);
                w.status = WarpStatus::Migrating;
                w.migration_latency = MIGRATION_COST;
                migrated = Some((w.id, from, target));
            }
        }

        w.record_status();

        if let Some((warp_id, from, to)) = migrated {
            self.log_migration(warp_id, from, to);
        }
    }

    /// The slot holder either stalls or retires one instruction.
    fn issue<R: Rng>(&mut self, kernel: &KernelProfile, outcome: &mut TickOutcome, rng: &mut R) {
        let cycle = self.cycle;
        let w = &mut self.warps[self.active_warp_id];

        if chance(rng, kernel.stall_probability) && w.progress > 0.0 && w.progress < STALL_WINDOW {
            w.status = WarpStatus::Stalled;
            w.stall_timer = MEMORY_LATENCY;
            w.stall_reason = Some(STALL_REASON_CACHE_MISS.to_string());
            debug!("W{:02} stalled at {:.1}%: {}", w.id, w.progress, STALL_REASON_CACHE_MISS);
            self.dispatch_next();
            return;
        }

        w.status = WarpStatus::Computing;
        w.progress += kernel.compute_step();
        w.instructions_executed += 1;
        w.instruction_mix.retire(rng);
        w.reroll_divergence(kernel.mask_chance(), rng);

        if w.progress >= 100.0 {
            w.status = WarpStatus::Committing;
            w.progress = 100.0;
            w.end_cycle = Some(cycle);
            let latency = cycle.saturating_sub(w.start_cycle.unwrap_or(0));
            debug!("W{:02} committed on SM{} after {} cycles", w.id, w.current_core_id, latency);
            outcome.completed.push(w.id);

            if self.latency_samples.len() == LATENCY_SAMPLES_LEN {
                self.latency_samples.pop_front();
            }
            self.latency_samples.push_back(latency);
            self.dispatch_next();
        }
    }

    /// Hand the slot to the first READY warp by id. Keeps the current holder
    /// if nothing is ready.
    fn dispatch_next(&mut self) {
        if let Some(next) = self.warps.iter().position(|w| w.status == WarpStatus::Ready) {
            self.active_warp_id = next;
        }
    }

    fn log_migration(&mut self, warp_id: usize, from: usize, to: usize) {
        let event = MigrationEvent {
            id: self.next_event_id,
            warp_id,
            from,
            to,
            latency_cycles: MIGRATION_COST,
            cycle: self.cycle,
        };
        self.next_event_id += 1;
        debug!("[{}] W{:02} migrating SM{} -> SM{}", event.cycle, warp_id, from, to);
        self.migration_log.push_front(event);
        self.migration_log.truncate(MIGRATION_LOG_LEN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_kernel, KernelPatch};
    use crate::warp::WARP_SIZE;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn kernel(stall: f64, intensity: f64) -> KernelProfile {
        default_kernel().patched(&KernelPatch {
            stall_probability: Some(stall),
            compute_intensity: Some(intensity),
            ..Default::default()
        })
    }

    #[test]
    fn only_slot_holder_progresses() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        let mut sched = WarpScheduler::new(12, 8);
        sched.migration_enabled = false;
        let k = kernel(0.0, 10.0);

        for _ in 0..50 {
            let before: Vec<f64> = sched.warps.iter().map(|w| w.progress).collect();
            let holder = sched.active_warp_id;
            sched.tick(&k, &mut rng);
            let advanced: Vec<usize> = sched
                .warps
                .iter()
                .zip(&before)
                .filter(|(w, p)| w.progress > **p)
                .map(|(w, _)| w.id)
                .collect();
            assert!(advanced.len() <= 1);
            if let Some(&id) = advanced.first() {
                assert_eq!(id, holder);
            }
        }
    }

    #[test]
    fn completion_hands_slot_to_first_ready() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(2);
        let mut sched = WarpScheduler::new(4, 8);
        sched.migration_enabled = false;
        // 7.5% per issue: 14 issues per warp
        let k = kernel(0.0, 15.0);
        let mut completed = Vec::new();
        for _ in 0..28 {
            completed.extend(sched.tick(&k, &mut rng).completed);
        }
        assert_eq!(completed, vec![0, 1]);
        assert_eq!(sched.warps[0].status, WarpStatus::Committing);
        assert_eq!(sched.warps[0].progress, 100.0);
        assert_eq!(sched.active_warp_id, 2);
        assert_eq!(sched.latency_samples.len(), 2);
    }

    #[test]
    fn stall_hands_slot_over_and_recovers() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(3);
        let mut sched = WarpScheduler::new(3, 8);
        sched.migration_enabled = false;
        sched.tick(&kernel(0.0, 4.0), &mut rng);
        assert_eq!(sched.warps[0].progress, 2.0);

        sched.tick(&kernel(1.0, 4.0), &mut rng);
        let w0 = &sched.warps[0];
        assert_eq!(w0.status, WarpStatus::Stalled);
        assert_eq!(w0.stall_timer, MEMORY_LATENCY);
        assert_eq!(w0.stall_reason.as_deref(), Some(STALL_REASON_CACHE_MISS));
        assert_eq!(sched.active_warp_id, 1);

        for _ in 0..MEMORY_LATENCY {
            sched.tick(&kernel(0.0, 4.0), &mut rng);
        }
        let w0 = &sched.warps[0];
        assert_eq!(w0.status, WarpStatus::Ready);
        assert_eq!(w0.stall_cycles, MEMORY_LATENCY as u64);
        assert!(w0.stall_reason.is_none());
    }

    #[test]
    fn fresh_warp_never_stalls() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(4);
        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        sched.tick(&kernel(1.0, 4.0), &mut rng);
        assert_eq!(sched.warps[0].status, WarpStatus::Computing);
    }

    #[test]
    fn no_stall_at_or_past_window_edge() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(10);
        let always_miss = kernel(1.0, 4.0);

        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        sched.warps[0].progress = STALL_WINDOW;
        sched.tick(&always_miss, &mut rng);
        let w0 = &sched.warps[0];
        assert_eq!(w0.status, WarpStatus::Computing);
        assert_eq!(w0.progress, STALL_WINDOW + 2.0);
        assert_eq!(sched.active_warp_id, 0);

        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        sched.warps[0].progress = 89.9;
        sched.tick(&always_miss, &mut rng);
        assert_eq!(sched.warps[0].status, WarpStatus::Stalled);
        assert_eq!(sched.warps[0].progress, 89.9);
        assert_eq!(sched.active_warp_id, 1);
    }

    #[test]
    fn window_edge_warp_completes_under_constant_misses() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(11);
        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        sched.warps[0].progress = STALL_WINDOW;
        // 5% per issue: two issues from 90 reach 100
        let k = kernel(1.0, 10.0);
        assert!(sched.tick(&k, &mut rng).completed.is_empty());
        assert_eq!(sched.tick(&k, &mut rng).completed, vec![0]);
        assert_eq!(sched.warps[0].status, WarpStatus::Committing);
    }

    #[test]
    fn disabled_migration_never_migrates() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(5);
        let mut sched = WarpScheduler::new(12, 8);
        sched.migration_enabled = false;
        let k = default_kernel();
        for _ in 0..2_000 {
            sched.tick(&k, &mut rng);
            assert!(sched.warps.iter().all(|w| w.status != WarpStatus::Migrating));
        }
        assert!(sched.migration_log.is_empty());
    }

    #[test]
    fn migrations_are_logged_and_bounded() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(6);
        let mut sched = WarpScheduler::new(12, 8);
        let k = kernel(0.0, 1.0);
        for _ in 0..3_000 {
            sched.tick(&k, &mut rng);
            assert!(sched.migration_log.len() <= MIGRATION_LOG_LEN);
            for w in &sched.warps {
                assert!(w.core_history.len() <= 6);
                assert_eq!(w.core_history.back(), Some(&w.current_core_id));
                assert_eq!(w.divergence_mask.len(), WARP_SIZE);
            }
        }
        assert!(!sched.migration_log.is_empty());
        let newest = &sched.migration_log[0];
        assert_ne!(newest.from, newest.to);
        assert_eq!(newest.latency_cycles, MIGRATION_COST);
    }

    #[test]
    fn throughput_sampled_every_tenth_cycle() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        let mut sched = WarpScheduler::new(12, 8);
        let k = default_kernel();
        for _ in 0..500 {
            sched.tick(&k, &mut rng);
        }
        assert_eq!(sched.throughput_history.len(), THROUGHPUT_HISTORY_LEN);
        assert!(sched.throughput_history.iter().all(|s| s.cycle % THROUGHPUT_INTERVAL == 0));
        assert_eq!(sched.throughput_history.back().map(|s| s.cycle), Some(490));
    }

    #[test]
    fn stale_recycle_is_ignored_after_reset() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(8);
        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        let k = kernel(0.0, 15.0);
        let mut done = Vec::new();
        while done.is_empty() {
            done = sched.tick(&k, &mut rng).completed;
        }
        let epoch = sched.epoch();
        sched.reset();
        assert!(!sched.recycle(done[0], epoch));
        assert!(sched.warps.iter().all(|w| w.status == WarpStatus::Ready && w.progress == 0.0));
        assert_eq!(sched.cycle, 0);
    }

    #[test]
    fn recycle_restores_ready() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(9);
        let mut sched = WarpScheduler::new(2, 8);
        sched.migration_enabled = false;
        let k = kernel(0.0, 15.0);
        let mut done = Vec::new();
        while done.is_empty() {
            done = sched.tick(&k, &mut rng).completed;
        }
        let id = done[0];
        assert!(sched.recycle(id, sched.epoch()));
        let w = &sched.warps[id];
        assert_eq!(w.status, WarpStatus::Ready);
        assert_eq!(w.progress, 0.0);
        assert!(w.start_cycle.is_none());
        assert!(w.divergence_mask.iter().all(|&l| l));
        // Second recycle of the same warp is a no-op
        assert!(!sched.recycle(id, sched.epoch()));
    }
}
