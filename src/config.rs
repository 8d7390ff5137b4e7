/// Simulator configuration: population sizes and clock periods.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of SMs on the accelerator
    pub num_cores: usize,
    /// Size of the fixed warp population
    pub num_warps: usize,
    pub num_host_cores: usize,
    pub num_memory_channels: usize,
    /// Global metric tick period in milliseconds
    pub speed_ms: u64,
    /// Warp scheduler tick period in milliseconds
    pub scheduler_period_ms: u64,
    /// Delay between a warp committing and being recycled, in milliseconds
    pub recycle_delay_ms: u64,
    /// Fixed RNG seed; entropy-seeded when absent
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            num_cores: 8,
            num_warps: 12,
            num_host_cores: 8,
            num_memory_channels: 6,
            speed_ms: 500,
            scheduler_period_ms: 100,
            recycle_delay_ms: 400,
            seed: None,
        }
    }
}

impl SimConfig {
    /// Parse a (possibly partial) JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
