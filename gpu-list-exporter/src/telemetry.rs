//! Prometheus metrics for GPU and process snapshots.
//!
//! Gauges live in a private registry that the HTTP layer renders on scrape.
//! Series are only ever overwritten, never removed: a GPU or process that
//! disappears keeps reporting its last value until the exporter restarts.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{Context, Result};
use chrono::Utc;
use gpu_list_exporter_common::{GpuIndex, GpuProcess, GpuSnapshot, SystemImageInfo};
use log::info;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const UNKNOWN_GPU_NAME: &str = "unknown";

const GPU_LABELS: [&str; 3] = ["hostname", "gpu_id", "gpu_name"];
const PROCESS_LABELS: [&str; 6] = ["hostname", "gpu_id", "gpu_name", "pid", "user", "command"];
const SYSTEM_LABELS: [&str; 4] = [
    "hostname",
    "boot_image_version",
    "os_version",
    "kernel_version",
];

/// Global metrics handle
static METRICS: OnceLock<Arc<GpuMetrics>> = OnceLock::new();

pub struct GpuMetrics {
    registry: Registry,

    pub temperature: GaugeVec,
    pub memory_free: GaugeVec,
    pub memory_used: GaugeVec,
    pub memory_total: GaugeVec,
    pub utilization: GaugeVec,
    pub memory_utilization: GaugeVec,

    pub process_memory: GaugeVec,
    pub process_count: GaugeVec,

    pub system_image_info: GaugeVec,

    pub collection_success: GaugeVec,
    pub last_success_timestamp: GaugeVec,

    /// Name last reported for each GPU index, used to label process series.
    gpu_names: RwLock<HashMap<GpuIndex, String>>,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)
        .with_context(|| format!("Failed to create gauge {}", name))?;
    registry
        .register(Box::new(gauge.clone()))
        .with_context(|| format!("Failed to register gauge {}", name))?;
    Ok(gauge)
}

impl GpuMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            temperature: gauge_vec(
                &registry,
                "nvidia_gpu_temperature_celsius",
                "GPU temperature in Celsius",
                &GPU_LABELS,
            )?,
            memory_free: gauge_vec(
                &registry,
                "nvidia_gpu_memory_free_bytes",
                "Free GPU memory in bytes",
                &GPU_LABELS,
            )?,
            memory_used: gauge_vec(
                &registry,
                "nvidia_gpu_memory_used_bytes",
                "Used GPU memory in bytes",
                &GPU_LABELS,
            )?,
            memory_total: gauge_vec(
                &registry,
                "nvidia_gpu_memory_total_bytes",
                "Total GPU memory in bytes",
                &GPU_LABELS,
            )?,
            utilization: gauge_vec(
                &registry,
                "nvidia_gpu_utilization_percent",
                "GPU utilization percentage",
                &GPU_LABELS,
            )?,
            memory_utilization: gauge_vec(
                &registry,
                "nvidia_gpu_memory_utilization_percent",
                "GPU memory utilization percentage",
                &GPU_LABELS,
            )?,
            process_memory: gauge_vec(
                &registry,
                "nvidia_gpu_process_memory_bytes",
                "GPU memory used by process in bytes",
                &PROCESS_LABELS,
            )?,
            process_count: gauge_vec(
                &registry,
                "nvidia_gpu_process_count",
                "Number of processes running on GPU",
                &GPU_LABELS,
            )?,
            system_image_info: gauge_vec(
                &registry,
                "nvidia_system_image_info",
                "System image information",
                &SYSTEM_LABELS,
            )?,
            collection_success: gauge_vec(
                &registry,
                "nvidia_gpu_exporter_collection_success",
                "Whether the last collection cycle succeeded (1) or failed (0)",
                &["collector"],
            )?,
            last_success_timestamp: gauge_vec(
                &registry,
                "nvidia_gpu_exporter_last_success_timestamp_seconds",
                "Unix time of the last successful collection",
                &["collector"],
            )?,
            gpu_names: RwLock::new(HashMap::new()),
            registry,
        })
    }

    pub fn update_gpu(&self, snapshots: &[GpuSnapshot]) {
        for gpu in snapshots {
            let gpu_id = gpu.gpu_id.to_string();
            let labels = [gpu.hostname.as_str(), gpu_id.as_str(), gpu.gpu_name.as_str()];

            self.temperature.with_label_values(&labels).set(gpu.temperature);
            self.memory_free
                .with_label_values(&labels)
                .set(mib_to_bytes(gpu.free_memory));
            self.memory_used
                .with_label_values(&labels)
                .set(mib_to_bytes(gpu.used_memory));
            self.memory_total
                .with_label_values(&labels)
                .set(mib_to_bytes(gpu.total_memory));
            self.utilization
                .with_label_values(&labels)
                .set(gpu.gpu_utilization);
            self.memory_utilization
                .with_label_values(&labels)
                .set(gpu.memory_utilization);
        }

        if let Ok(mut names) = self.gpu_names.write() {
            for gpu in snapshots {
                names.insert(gpu.gpu_id, gpu.gpu_name.clone());
            }
        }
    }

    pub fn update_processes(&self, processes: &[GpuProcess]) {
        let names = match self.gpu_names.read() {
            Ok(names) => names.clone(),
            Err(_) => HashMap::new(),
        };

        let mut counts: HashMap<(&str, GpuIndex), u64> = HashMap::new();
        for process in processes {
            let gpu_id = process.gpu_id.to_string();
            let pid = process.pid.to_string();
            self.process_memory
                .with_label_values(&[
                    process.hostname.as_str(),
                    gpu_id.as_str(),
                    gpu_name(&names, process.gpu_id),
                    pid.as_str(),
                    process.user.as_str(),
                    process.command.as_str(),
                ])
                .set(mib_to_bytes(process.used_gpu_memory));

            *counts
                .entry((process.hostname.as_str(), process.gpu_id))
                .or_default() += 1;
        }

        for ((hostname, gpu_id), count) in counts {
            let id = gpu_id.to_string();
            self.process_count
                .with_label_values(&[hostname, id.as_str(), gpu_name(&names, gpu_id)])
                .set(count as f64);
        }
    }

    pub fn update_system_info(&self, info: &SystemImageInfo) {
        self.system_image_info
            .with_label_values(&[
                info.hostname.as_str(),
                info.boot_image_version.as_str(),
                info.os_version.as_str(),
                info.kernel_version.as_str(),
            ])
            .set(1.0);
    }

    /// Record the outcome of one collection step (`gpu` or `process`).
    pub fn record_collection(&self, collector: &str, success: bool) {
        self.collection_success
            .with_label_values(&[collector])
            .set(if success { 1.0 } else { 0.0 });
        if success {
            self.last_success_timestamp
                .with_label_values(&[collector])
                .set(Utc::now().timestamp() as f64);
        }
    }

    /// Render every registered series in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }

    #[cfg(test)]
    fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn gpu_name(names: &HashMap<GpuIndex, String>, gpu_id: GpuIndex) -> &str {
    names
        .get(&gpu_id)
        .map(String::as_str)
        .unwrap_or(UNKNOWN_GPU_NAME)
}

fn mib_to_bytes(mib: u64) -> f64 {
    mib as f64 * BYTES_PER_MIB
}

/// Create the process-wide metrics handle. Later calls return the same handle.
pub fn init_metrics() -> Result<Arc<GpuMetrics>> {
    if let Some(existing) = METRICS.get() {
        return Ok(Arc::clone(existing));
    }
    let created = Arc::new(GpuMetrics::new()?);
    let metrics = METRICS.get_or_init(|| created);
    info!("Prometheus metrics registry initialized");
    Ok(Arc::clone(metrics))
}
