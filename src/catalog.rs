/// Kernel profiles and enterprise workload presets.
/// A kernel profile shapes the warp scheduler (how often warps stall, how far
/// each issue advances them); an enterprise task shapes the chip-wide load.
/// Both catalogs are static; the chip holds a per-run copy of the active profile.
use serde::{Deserialize, Serialize};

/// Workload-shape parameters applied globally to the active simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Chance per issue that the dispatched warp misses cache [0.0, 1.0]
    pub stall_probability: f64,
    /// ALU density [1.0, 15.0]. Each issue advances progress by half of this.
    pub compute_intensity: f64,
    /// VRAM pressure [1, 10]
    pub memory_pressure: u32,
    pub register_requirement: u32,
}

impl KernelProfile {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        stall_probability: f64,
        compute_intensity: f64,
        memory_pressure: u32,
        register_requirement: u32,
    ) -> Self {
        KernelProfile {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            stall_probability,
            compute_intensity,
            memory_pressure,
            register_requirement,
        }
    }

    /// Progress gained by the dispatched warp per retired instruction.
    pub fn compute_step(&self) -> f64 {
        self.compute_intensity / 2.0
    }

    /// Probability that a lane is masked off on a given issue.
    /// Lower compute intensity widens divergence; above 10 nothing diverges.
    pub fn mask_chance(&self) -> f64 {
        (10.0 - self.compute_intensity) / 20.0
    }

    /// Apply a partial override, clamping every field into its legal range.
    pub fn patched(&self, patch: &KernelPatch) -> Self {
        let mut next = self.clone();
        if let Some(p) = patch.stall_probability {
            next.stall_probability = p.clamp(0.0, 1.0);
        }
        if let Some(c) = patch.compute_intensity {
            next.compute_intensity = c.clamp(1.0, 15.0);
        }
        if let Some(m) = patch.memory_pressure {
            next.memory_pressure = m.clamp(1, 10);
        }
        if let Some(r) = patch.register_requirement {
            next.register_requirement = r;
        }
        next
    }

    /// Same profile with every numeric field forced into its legal range.
    pub fn with_clamped_fields(&self) -> KernelProfile {
        self.patched(&KernelPatch {
            stall_probability: Some(self.stall_probability),
            compute_intensity: Some(self.compute_intensity),
            memory_pressure: Some(self.memory_pressure),
            register_requirement: None,
        })
    }
}

/// Field-wise override of the active kernel profile. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelPatch {
    pub stall_probability: Option<f64>,
    pub compute_intensity: Option<f64>,
    pub memory_pressure: Option<u32>,
    pub register_requirement: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    Ai,
    Business,
    Science,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskCategory::Ai       => write!(f, "AI"),
            TaskCategory::Business => write!(f, "BUSINESS"),
            TaskCategory::Science  => write!(f, "SCIENCE"),
        }
    }
}

/// An enterprise workload preset. Selecting one drives the global workload level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseTask {
    pub id: String,
    pub category: TaskCategory,
    pub name: String,
    pub description: String,
    /// Workload level the chip runs at while this task is active [0, 100]
    pub load_profile: u32,
    pub target_compute: u32,
    pub target_memory: u32,
    pub target_pcie: u32,
    pub expected_latency: String,
}

impl EnterpriseTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: &str,
        category: TaskCategory,
        name: &str,
        description: &str,
        load_profile: u32,
        target_compute: u32,
        target_memory: u32,
        target_pcie: u32,
        expected_latency: &str,
    ) -> Self {
        EnterpriseTask {
            id: id.to_string(),
            category,
            name: name.to_string(),
            description: description.to_string(),
            load_profile,
            target_compute,
            target_memory,
            target_pcie,
            expected_latency: expected_latency.to_string(),
        }
    }
}

/// All selectable kernel profiles. The first entry is the power-on default.
pub fn kernel_profiles() -> Vec<KernelProfile> {
    vec![
        KernelProfile::new("gemm", "Tensor GEMM (FP16)", "Large Matrix Multiplication.", 0.02, 9.0, 4, 8),
        KernelProfile::new("fft", "FFT (Radix-4)", "Fast Fourier Transform.", 0.08, 5.0, 9, 5),
        KernelProfile::new("raytrace", "BVH Traversal", "Ray-Box intersection testing.", 0.25, 4.0, 6, 4),
    ]
}

/// All selectable enterprise workload presets.
pub fn enterprise_tasks() -> Vec<EnterpriseTask> {
    use TaskCategory::*;
    vec![
        EnterpriseTask::new("sci-nwp", Science, "Weather NWP", "Global grid Numerical Weather Prediction.", 92, 9, 8, 4, "High"),
        EnterpriseTask::new("sci-drug", Science, "In Silico Discovery", "VHTS Ligand Docking simulation.", 82, 7, 5, 9, "Medium"),
        EnterpriseTask::new("ai-train", Ai, "LLM Training", "Parameter gradient updates.", 95, 10, 8, 5, "High"),
        EnterpriseTask::new("bus-stock", Business, "HFT Trading", "Ultra-low latency limit order execution.", 40, 4, 3, 10, "Ultra"),
    ]
}

pub fn default_kernel() -> KernelProfile {
    // gemm
    kernel_profiles().swap_remove(0)
}

pub fn find_kernel(id: &str) -> Option<KernelProfile> {
    kernel_profiles().into_iter().find(|k| k.id == id)
}

pub fn find_task(id: &str) -> Option<EnterpriseTask> {
    enterprise_tasks().into_iter().find(|t| t.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        assert_eq!(default_kernel().id, "gemm");
        assert_eq!(find_kernel("fft").map(|k| k.memory_pressure), Some(9));
        assert_eq!(find_task("ai-train").map(|t| t.load_profile), Some(95));
        assert!(find_task("nope").is_none());
    }

    #[test]
    fn patch_clamps_fields() {
        let k = default_kernel().patched(&KernelPatch {
            stall_probability: Some(1.7),
            compute_intensity: Some(0.0),
            memory_pressure: Some(42),
            register_requirement: None,
        });
        assert_eq!(k.stall_probability, 1.0);
        assert_eq!(k.compute_intensity, 1.0);
        assert_eq!(k.memory_pressure, 10);
        assert_eq!(k.register_requirement, 8);
        assert_eq!(k.id, "gemm");
    }

    #[test]
    fn mask_chance_follows_intensity() {
        let k = default_kernel();
        assert!((k.mask_chance() - 0.05).abs() < 1e-12);
        assert!((k.compute_step() - 4.5).abs() < 1e-12);
        let dense = k.patched(&KernelPatch { compute_intensity: Some(14.0), ..Default::default() });
        assert!(dense.mask_chance() < 0.0);
    }
}
