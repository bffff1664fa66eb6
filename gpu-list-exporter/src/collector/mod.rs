//! nvidia-smi backed collection.
//!
//! Every call shells out afresh; nothing is cached between cycles.

use std::time::Duration;

use anyhow::{Context, Result};
use gpu_list_exporter_common::{GpuProcess, GpuSnapshot};
use log::{debug, info};

pub mod error;
pub mod gpu;
pub mod process;
pub mod shell;
pub mod units;
pub mod uuid_index;

pub use error::CollectError;
use process::{join_row, parse_compute_apps, parse_processes, parse_ps_output, ps_command};
pub use shell::{CommandRunner, ShellCommand, SystemRunner};
use uuid_index::UuidIndex;

use crate::settings::CollectorSettings;

const CSV_FORMAT: &str = "--format=csv,noheader";

pub struct Collector<R = SystemRunner> {
    runner: R,
    nvidia_smi_path: String,
    timeout: Duration,
    hostname: String,
}

impl Collector<SystemRunner> {
    /// Create a collector and verify that nvidia-smi can be executed.
    pub async fn new(settings: &CollectorSettings, hostname: String) -> Result<Self> {
        let collector = Self::with_runner(SystemRunner, settings, hostname);
        collector
            .check_availability()
            .await
            .context("nvidia-smi availability check failed")?;
        Ok(collector)
    }
}

impl<R: CommandRunner> Collector<R> {
    pub fn with_runner(runner: R, settings: &CollectorSettings, hostname: String) -> Self {
        Self {
            runner,
            nvidia_smi_path: settings.nvidia_smi_path.clone(),
            timeout: settings.timeout,
            hostname,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn smi(&self, query: String) -> ShellCommand {
        ShellCommand::new(
            self.nvidia_smi_path.clone(),
            [query, CSV_FORMAT.to_string()],
            self.timeout,
        )
    }

    pub async fn check_availability(&self) -> Result<(), CollectError> {
        let version = ShellCommand::new(self.nvidia_smi_path.clone(), ["--version"], self.timeout);
        let output = self.runner.run(&version).await?;
        info!(
            "Found {}: {}",
            self.nvidia_smi_path,
            String::from_utf8_lossy(&output)
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim()
        );
        Ok(())
    }

    /// Query device-level readings for every GPU.
    pub async fn collect_gpu_metrics(&self) -> Result<Vec<GpuSnapshot>, CollectError> {
        let query = self.smi(format!("--query-gpu={}", gpu::GPU_QUERY_FIELDS));
        let output = self.runner.run(&query).await?;
        gpu::parse_gpu_metrics(&output, &self.hostname)
    }

    /// Query compute processes and join them with `ps`.
    ///
    /// The pipeline makes several sequential calls, so it gets twice the
    /// per-command timeout as an overall budget.
    pub async fn collect_processes(&self) -> Result<Vec<GpuProcess>, CollectError> {
        let budget = self.timeout * 2;
        match tokio::time::timeout(budget, self.collect_processes_inner()).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Timeout {
                program: "process collection".to_string(),
                timeout: budget,
            }),
        }
    }

    async fn collect_processes_inner(&self) -> Result<Vec<GpuProcess>, CollectError> {
        let index_output = self
            .runner
            .run(&self.smi(format!("--query-gpu={}", uuid_index::UUID_QUERY_FIELDS)))
            .await?;
        let index = UuidIndex::parse(&index_output)?;
        debug!("Known GPU UUIDs: {}", index.len());

        let apps_output = self
            .runner
            .run(&self.smi(format!(
                "--query-compute-apps={}",
                process::COMPUTE_APPS_QUERY_FIELDS
            )))
            .await?;
        let apps = parse_compute_apps(&apps_output)?;

        let mut joined = String::new();
        for app in &apps {
            let info = self.lookup_process(app.pid).await?;
            joined.push_str(&join_row(app, info.as_ref()));
            joined.push('\n');
        }

        parse_processes(&joined, &index, &self.hostname)
    }

    /// `ps` exits non-zero when the PID no longer exists; that is a miss, not
    /// an error. Failing to run `ps` at all is.
    async fn lookup_process(
        &self,
        pid: u32,
    ) -> Result<Option<process::OsProcessInfo>, CollectError> {
        match self.runner.run(&ps_command(pid, self.timeout)).await {
            Ok(output) => Ok(parse_ps_output(&output)),
            Err(CollectError::CommandFailed { code, .. }) => {
                debug!("Process {} exited before lookup (ps status {:?})", pid, code);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
