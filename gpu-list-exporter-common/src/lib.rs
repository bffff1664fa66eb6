//! Record types shared between the collector and the metric projector.
//!
//! Every record is rebuilt from scratch on each poll cycle and never mutated
//! afterwards.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Short integer index nvidia-smi assigns to each physical GPU.
pub type GpuIndex = u32;

/// Point-in-time readings for one physical GPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSnapshot {
    pub hostname: String,
    pub gpu_id: GpuIndex,
    pub timestamp: DateTime<Utc>,
    pub gpu_name: String,
    /// Degrees Celsius.
    pub temperature: f64,
    /// MiB
    pub free_memory: u64,
    /// MiB
    pub used_memory: u64,
    /// MiB
    pub total_memory: u64,
    pub gpu_utilization: f64,
    /// Memory-copy utilization, percent.
    pub memory_utilization: f64,
}

/// One compute process resident on a GPU, joined with its OS-level usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuProcess {
    pub hostname: String,
    pub gpu_id: GpuIndex,
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub pid: u32,
    pub process_name: String,
    /// MiB
    pub used_gpu_memory: u64,
    pub used_cpu: f64,
    pub used_memory: f64,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemImageInfo {
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub os_version: String,
    pub kernel_version: String,
    pub boot_image_version: String,
}
