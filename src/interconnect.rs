/// Host-side bus models: the PCIe link between host and accelerator, and the
/// host system (CPU cores, RAM, SSD) that feeds it.
///
/// Traffic follows the chip's pipeline phase:
///   FETCHING   — host-to-device DMA; SSD reads; CPU/RAM/SSD sources active
///   COMMITTING — device-to-host writeback; SSD writes
///   otherwise  — background control traffic only
///
/// Link reference:
///   PCIe 5.0 x16 — ~64 GB/s per direction
use crate::chip::Phase;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Peak host-to-device rate in GB/s at 100% workload
pub const H2D_PEAK_GB_S: f64 = 58.0;
/// Peak device-to-host rate in GB/s at 100% workload
pub const D2H_PEAK_GB_S: f64 = 42.0;
/// SSD read IOPS per workload percent during FETCHING
pub const IOPS_PER_LOAD: f64 = 50.0;

// ---------------------------------------------------------------------------
// PCIe link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    LinkUp,
    Training,
    Down,
}

/// Per-source figures for the three DMA sources on the host side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSplit {
    pub cpu: f64,
    pub ram: f64,
    pub ssd: f64,
}

impl SourceSplit {
    /// Fixed fractional split of the host-to-device rate across sources
    pub fn of_h2d(h2d_rate: f64) -> Self {
        SourceSplit { cpu: h2d_rate * 0.8, ram: h2d_rate, ssd: h2d_rate * 0.3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcieLink {
    pub lanes: u32,
    pub bandwidth_gb_s: f64,
    /// Link utilization as a percentage [0, 100]
    pub utilization: f64,
    pub status: LinkStatus,
    /// Host-to-device rate in GB/s
    pub h2d_rate: f64,
    /// Device-to-host rate in GB/s
    pub d2h_rate: f64,
    /// Access latency per source in nanoseconds
    pub latency_ns: SourceSplit,
    /// Throughput per source in GB/s
    pub source_throughput: SourceSplit,
}

impl PcieLink {
    /// PCIe 5.0 x16 link, trained and idle
    pub fn gen5_x16() -> Self {
        PcieLink {
            lanes: 16,
            bandwidth_gb_s: 64.0,
            utilization: 0.0,
            status: LinkStatus::LinkUp,
            h2d_rate: 0.0,
            d2h_rate: 0.0,
            latency_ns: SourceSplit { cpu: 120.0, ram: 145.0, ssd: 4500.0 },
            source_throughput: SourceSplit::default(),
        }
    }

    /// Link state for one global tick at the given workload and phase.
    pub fn step(&self, workload: f64, phase: Phase) -> PcieLink {
        let utilization = if workload <= 0.0 {
            0.0
        } else if matches!(phase, Phase::Fetching | Phase::Committing) {
            workload * 0.7
        } else {
            workload * 0.2
        };
        let h2d_rate = if phase == Phase::Fetching { workload / 100.0 * H2D_PEAK_GB_S } else { 0.0 };
        let d2h_rate = if phase == Phase::Committing { workload / 100.0 * D2H_PEAK_GB_S } else { 0.0 };
        let source_throughput = if phase == Phase::Fetching {
            SourceSplit::of_h2d(h2d_rate)
        } else {
            SourceSplit::default()
        };

        PcieLink {
            utilization,
            h2d_rate,
            d2h_rate,
            source_throughput,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Host system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// Load per host CPU core [2, 100] once ticked
    pub cpu_cores: Vec<f64>,
    /// Resident RAM in GB. Drifts with workload and is not clamped.
    pub ram_usage_gb: f64,
    pub ram_latency_ns: f64,
    pub ssd_read_iops: f64,
    pub ssd_write_iops: f64,
    pub ssd_temp_c: f64,
}

impl HostMetrics {
    pub fn new(num_cpu_cores: usize) -> Self {
        HostMetrics {
            cpu_cores: vec![0.0; num_cpu_cores],
            ram_usage_gb: 12.5,
            ram_latency_ns: 45.0,
            ssd_read_iops: 0.0,
            ssd_write_iops: 0.0,
            ssd_temp_c: 38.0,
        }
    }

    pub fn step<R: Rng>(&self, workload: f64, phase: Phase, rng: &mut R) -> HostMetrics {
        let base_load = if workload > 0.0 { workload * 0.4 } else { 5.0 };
        // Every core is resampled independently each tick
        let cpu_cores = self
            .cpu_cores
            .iter()
            .map(|_| (base_load + rng.gen_range(0.0..15.0)).clamp(2.0, 100.0))
            .collect();

        let ram_usage_gb = 12.5 + workload / 100.0 * 32.0 + rng.gen_range(0.0..1.0);
        let peak_iops = workload * IOPS_PER_LOAD;
        let ssd_read_iops = if phase == Phase::Fetching { peak_iops } else { 0.0 };
        // Writes track this tick's reads, which are zero outside FETCHING
        let ssd_write_iops = if phase == Phase::Committing { ssd_read_iops * 0.2 } else { 0.0 };

        HostMetrics {
            cpu_cores,
            ram_usage_gb,
            ssd_read_iops,
            ssd_write_iops,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    #[test]
    fn fetching_drives_h2d_only() {
        let link = PcieLink::gen5_x16().step(50.0, Phase::Fetching);
        assert!((link.h2d_rate - 29.0).abs() < 1e-9);
        assert_eq!(link.d2h_rate, 0.0);
        assert!((link.utilization - 35.0).abs() < 1e-9);
        assert!((link.source_throughput.cpu - 23.2).abs() < 1e-9);
        assert!((link.source_throughput.ssd - 8.7).abs() < 1e-9);
    }

    #[test]
    fn committing_drives_d2h_only() {
        let link = PcieLink::gen5_x16().step(100.0, Phase::Committing);
        assert_eq!(link.h2d_rate, 0.0);
        assert!((link.d2h_rate - 42.0).abs() < 1e-9);
        assert_eq!(link.source_throughput, SourceSplit::default());
    }

    #[test]
    fn idle_link_is_quiet() {
        let link = PcieLink::gen5_x16().step(0.0, Phase::Idle);
        assert_eq!(link.utilization, 0.0);
        assert_eq!(link.status, LinkStatus::LinkUp);
    }

    #[test]
    fn host_cpu_loads_bounded() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(3);
        let host = HostMetrics::new(8);
        for workload in [0.0, 40.0, 100.0] {
            let next = host.step(workload, Phase::Executing, &mut rng);
            assert_eq!(next.cpu_cores.len(), 8);
            assert!(next.cpu_cores.iter().all(|&l| (2.0..=100.0).contains(&l)));
            assert!(next.ram_usage_gb >= 12.5 + workload / 100.0 * 32.0);
            assert_eq!(next.ssd_read_iops, 0.0);
        }
    }

    #[test]
    fn ssd_writes_follow_same_tick_reads() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(4);
        let host = HostMetrics::new(2);
        let fetch = host.step(60.0, Phase::Fetching, &mut rng);
        assert_eq!(fetch.ssd_read_iops, 3000.0);
        assert_eq!(fetch.ssd_write_iops, 0.0);
        let commit = fetch.step(60.0, Phase::Committing, &mut rng);
        assert_eq!(commit.ssd_read_iops, 0.0);
        assert_eq!(commit.ssd_write_iops, 0.2 * commit.ssd_read_iops);
        assert_eq!(commit.ssd_write_iops, 0.0);
    }
}
