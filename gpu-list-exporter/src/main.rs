use anyhow::{Context, Result};
use log::info;

use gpu_list_exporter::ExporterEngine;
use gpu_list_exporter::settings::{Settings, parse_cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = Settings::new(&cli).context("Failed to load configuration")?;
    info!(
        "Starting gpu-list-exporter on {} (interval {}s, timeout {:?}, nvidia-smi at {})",
        settings.server.bind_address(),
        settings.server.metrics_update_interval,
        settings.collector.timeout,
        settings.collector.nvidia_smi_path
    );

    let engine = ExporterEngine::new(settings).await?;
    engine.run().await
}
