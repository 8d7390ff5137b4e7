/// Streaming Multiprocessor (SM) — one compute core slot on the accelerator.
/// Each SM runs a leaky-integrator thermal model: utilization heats it,
/// passive cooling pulls it back, and above the trip point it throttles.
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const MIN_TEMP_C: f64 = 30.0;
pub const MAX_TEMP_C: f64 = 110.0;
/// Throttling is in effect strictly above this temperature
pub const THROTTLE_TEMP_C: f64 = 95.0;
pub const IDLE_TEMP_C: f64 = 35.0;
/// A throttled SM runs at this fraction of its would-be utilization
pub const THROTTLE_DERATE: f64 = 0.4;
/// Utilization lost per tick when the SM has no work
pub const UTIL_DECAY: f64 = 15.0;
const HEAT_PER_TICK: f64 = 1.5;
const COOLING_PER_TICK: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreStatus {
    Idle,
    Busy,
}

/// Load balancer role. Modeled but never assigned: every tick clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingRole {
    Donor,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeCore {
    pub id: usize,
    pub status: CoreStatus,
    /// Effective utilization [0, 100], already derated if throttled
    pub utilization: f64,
    pub temperature_c: f64,
    pub is_throttled: bool,
    pub active_warps: u32,
    pub tensor_unit_load: f64,
    pub register_usage: f64,
    pub balancing_status: Option<BalancingRole>,
}

impl ComputeCore {
    pub fn new(id: usize) -> Self {
        ComputeCore {
            id,
            status: CoreStatus::Idle,
            utilization: 0.0,
            temperature_c: IDLE_TEMP_C,
            is_throttled: false,
            active_warps: 0,
            tensor_unit_load: 0.0,
            register_usage: 0.0,
            balancing_status: None,
        }
    }

    /// Advance this SM by one global tick.
    /// `busy` is true when the chip is executing with meaningful workload.
    pub fn step<R: Rng>(&self, workload: f64, busy: bool, rng: &mut R) -> ComputeCore {
        let next_util = if busy {
            (workload * 0.9 + rng.gen_range(0.0..10.0)).min(100.0)
        } else {
            (self.utilization - UTIL_DECAY).max(0.0)
        };
        self.settle(next_util)
    }

    /// Fold a would-be utilization into temperature, throttling and status.
    /// Deterministic half of `step`, separated so the thermal model can be
    /// driven directly.
    pub fn settle(&self, next_util: f64) -> ComputeCore {
        let next_temp = (self.temperature_c + (next_util / 100.0) * HEAT_PER_TICK
            - COOLING_PER_TICK)
            .clamp(MIN_TEMP_C, MAX_TEMP_C);

        let is_throttled = next_temp > THROTTLE_TEMP_C;
        let effective = if is_throttled { next_util * THROTTLE_DERATE } else { next_util };

        ComputeCore {
            status: if effective > 10.0 { CoreStatus::Busy } else { CoreStatus::Idle },
            utilization: effective,
            active_warps: if effective > 0.0 { (effective / 4.0).floor() as u32 + 1 } else { 0 },
            temperature_c: next_temp,
            is_throttled,
            balancing_status: None,
            ..self.clone()
        }
    }
}
