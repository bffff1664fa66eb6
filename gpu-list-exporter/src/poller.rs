use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collector::{Collector, CommandRunner};
use crate::telemetry::GpuMetrics;

pub const GPU_COLLECTOR: &str = "gpu";
pub const PROCESS_COLLECTOR: &str = "process";

/// One collection cycle: device readings, then processes. A failure in
/// either step is logged and leaves that step's previous series in place.
pub async fn run_cycle<R: CommandRunner>(collector: &Collector<R>, metrics: &GpuMetrics) {
    match collector.collect_gpu_metrics().await {
        Ok(gpus) => {
            metrics.update_gpu(&gpus);
            metrics.record_collection(GPU_COLLECTOR, true);
            info!("GPU metrics updated: {} items", gpus.len());
        }
        Err(e) => {
            metrics.record_collection(GPU_COLLECTOR, false);
            warn!("Failed to collect GPU metrics: {}", e);
        }
    }

    match collector.collect_processes().await {
        Ok(processes) => {
            metrics.update_processes(&processes);
            metrics.record_collection(PROCESS_COLLECTOR, true);
            if processes.is_empty() {
                info!("Process information updated: no GPU processes running");
            } else {
                info!("Process information updated: {} processes", processes.len());
            }
        }
        Err(e) => {
            metrics.record_collection(PROCESS_COLLECTOR, false);
            warn!("Failed to collect process information: {}", e);
        }
    }
}

/// Run a cycle immediately, then once per `period`. A slow cycle delays the
/// next tick instead of bunching cycles together.
pub fn spawn_poll_loop<R>(
    collector: Arc<Collector<R>>,
    metrics: Arc<GpuMetrics>,
    period: Duration,
) -> JoinHandle<()>
where
    R: CommandRunner + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_cycle(&collector, &metrics).await;
        }
    })
}
