pub mod collector;
pub mod node;
pub mod poller;
pub mod server;
pub mod settings;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;

use crate::collector::Collector;
use crate::settings::Settings;
use crate::telemetry::GpuMetrics;

/// Time allowed for in-flight requests to finish after a shutdown signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub struct ExporterEngine {
    pub settings: Settings,
    collector: Arc<Collector>,
    metrics: Arc<GpuMetrics>,
}

impl ExporterEngine {
    pub async fn new(settings: Settings) -> Result<Self> {
        let hostname = node::resolve_hostname(settings.collector.hostname_override.as_deref());
        info!("Using hostname: {}", hostname);

        let collector = Collector::new(&settings.collector, hostname).await?;
        let metrics = telemetry::init_metrics()?;

        if settings.collector.track_system_info {
            let system_info = node::read_system_image_info(collector.hostname());
            info!(
                "System image: os={}, kernel={}, boot image={}",
                system_info.os_version, system_info.kernel_version, system_info.boot_image_version
            );
            metrics.update_system_info(&system_info);
        }

        Ok(Self {
            settings,
            collector: Arc::new(collector),
            metrics,
        })
    }

    pub async fn run(self) -> Result<()> {
        let address = self.settings.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        let poller = poller::spawn_poll_loop(
            Arc::clone(&self.collector),
            Arc::clone(&self.metrics),
            self.settings.server.update_interval(),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = server::router(Arc::clone(&self.metrics));
        let mut server = tokio::spawn(server::serve(listener, app, async move {
            shutdown_rx.await.ok();
        }));
        info!("Server listening on {}", address);

        tokio::select! {
            result = &mut server => {
                poller.abort();
                return result.context("HTTP server task panicked")?;
            }
            result = shutdown_signal() => result?,
        }

        info!("Shutdown initiated...");
        poller.abort();
        shutdown_tx.send(()).ok();

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, server).await {
            Ok(Ok(Ok(()))) => info!("Server stopped"),
            Ok(Ok(Err(e))) => warn!("Shutdown error: {:#}", e),
            Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
            Err(_) => warn!(
                "Server did not stop within {}s",
                SHUTDOWN_GRACE_PERIOD.as_secs()
            ),
        }

        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => result.context("Failed to listen for Ctrl-C"),
        _ = terminate.recv() => Ok(()),
    }
}
