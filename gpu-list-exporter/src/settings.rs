use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, File};
use serde::{Deserialize, Deserializer};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UPDATE_INTERVAL_SECONDS: u32 = 15;
const DEFAULT_TIMEOUT: &str = "10s";
const DEFAULT_NVIDIA_SMI_PATH: &str = "nvidia-smi";

/// Command line. Every flag can also come from the environment; an explicit
/// flag wins over the variable.
#[derive(Debug, Default, Parser)]
#[command(
    name = "gpu-list-exporter",
    version,
    about = "Exports nvidia-smi GPU and per-process metrics for Prometheus"
)]
pub struct Cli {
    /// Optional settings file (YAML or TOML)
    #[arg(long, env = "EXPORTER_CONFIG")]
    pub config: Option<String>,

    /// HTTP server host
    #[arg(long, env = "EXPORTER_HOST")]
    pub host: Option<String>,

    /// HTTP server port
    #[arg(long, env = "EXPORTER_PORT")]
    pub port: Option<u16>,

    /// Metrics update interval (seconds)
    #[arg(long, env = "EXPORTER_INTERVAL")]
    pub interval: Option<u32>,

    /// nvidia-smi command timeout, e.g. `10s` or `500ms` (bare numbers are seconds)
    #[arg(long, env = "EXPORTER_TIMEOUT", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Path to nvidia-smi command
    #[arg(long, env = "NVIDIA_SMI_PATH")]
    pub nvidia_smi_path: Option<String>,

    /// Hostname override
    #[arg(long, env = "HOSTNAME_OVERRIDE")]
    pub hostname: Option<String>,

    /// Export the system image info metric
    #[arg(long, env = "EXPORTER_TRACK_SYSTEM_INFO")]
    pub track_system_info: Option<bool>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse a duration such as `10s`, `1m30s` or `500ms`. A bare number is
/// taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value).map_err(|e| format!("invalid duration {:?}: {}", value, e))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Load `.env` into the process environment, then parse the command line.
pub fn parse_cli() -> Cli {
    dotenvy::dotenv().ok();
    Cli::parse()
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub metrics_update_interval: u64,
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_update_interval)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CollectorSettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    pub nvidia_smi_path: String,
    pub hostname_override: Option<String>,
    pub track_system_info: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub collector: CollectorSettings,
}

impl Settings {
    /// Layer defaults, the optional settings file and the command line, then
    /// validate the result.
    pub fn new(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", DEFAULT_HOST)?
            .set_default("server.port", i64::from(DEFAULT_PORT))?
            .set_default(
                "server.metrics_update_interval",
                i64::from(DEFAULT_UPDATE_INTERVAL_SECONDS),
            )?
            .set_default("collector.timeout", DEFAULT_TIMEOUT)?
            .set_default("collector.nvidia_smi_path", DEFAULT_NVIDIA_SMI_PATH)?
            .set_default("collector.track_system_info", true)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let settings: Self = builder
            .set_override_option("server.host", cli.host.clone())?
            .set_override_option("server.port", cli.port.map(i64::from))?
            .set_override_option(
                "server.metrics_update_interval",
                cli.interval.map(i64::from),
            )?
            .set_override_option(
                "collector.timeout",
                cli.timeout
                    .map(|timeout| humantime::format_duration(timeout).to_string()),
            )?
            .set_override_option("collector.nvidia_smi_path", cli.nvidia_smi_path.clone())?
            .set_override_option("collector.hostname_override", cli.hostname.clone())?
            .set_override_option("collector.track_system_info", cli.track_system_info)?
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(format!(
                "invalid port number: {}",
                self.server.port
            )));
        }
        if self.server.metrics_update_interval == 0 {
            return Err(ConfigError::Message(format!(
                "invalid update interval: {}",
                self.server.metrics_update_interval
            )));
        }
        if self.collector.timeout.is_zero() {
            return Err(ConfigError::Message(format!(
                "invalid timeout: {:?}",
                self.collector.timeout
            )));
        }
        if self.collector.nvidia_smi_path.trim().is_empty() {
            return Err(ConfigError::Message(
                "nvidia-smi path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 5] = [
        "EXPORTER_HOST",
        "EXPORTER_PORT",
        "EXPORTER_INTERVAL",
        "EXPORTER_TIMEOUT",
        "NVIDIA_SMI_PATH",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::new(&Cli::default()).expect("Failed to load settings");

        assert_eq!(settings.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(settings.server.update_interval(), Duration::from_secs(15));
        assert_eq!(settings.collector.timeout, Duration::from_secs(10));
        assert_eq!(settings.collector.nvidia_smi_path, "nvidia-smi");
        assert_eq!(settings.collector.hostname_override, None);
        assert!(settings.collector.track_system_info);
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Cli {
            host: Some("127.0.0.1".to_string()),
            port: Some(9400),
            interval: Some(5),
            timeout: Some(Duration::from_millis(2500)),
            nvidia_smi_path: Some("/usr/bin/nvidia-smi".to_string()),
            hostname: Some("gpu-node-7".to_string()),
            track_system_info: Some(false),
            ..Default::default()
        };
        let settings = Settings::new(&cli).unwrap();

        assert_eq!(settings.server.bind_address(), "127.0.0.1:9400");
        assert_eq!(settings.server.metrics_update_interval, 5);
        assert_eq!(settings.collector.timeout, Duration::from_millis(2500));
        assert_eq!(settings.collector.nvidia_smi_path, "/usr/bin/nvidia-smi");
        assert_eq!(
            settings.collector.hostname_override.as_deref(),
            Some("gpu-node-7")
        );
        assert!(!settings.collector.track_system_info);
    }

    #[test]
    #[serial]
    fn test_env_fills_flags_and_flags_win() {
        clear_env();
        unsafe {
            std::env::set_var("EXPORTER_PORT", "9100");
            std::env::set_var("EXPORTER_INTERVAL", "42");
            std::env::set_var("NVIDIA_SMI_PATH", "/opt/nvidia/bin/nvidia-smi");
        }

        let cli = Cli::try_parse_from(["gpu-list-exporter", "--port", "9200"]).unwrap();
        let settings = Settings::new(&cli).unwrap();

        assert_eq!(settings.server.port, 9200);
        assert_eq!(settings.server.metrics_update_interval, 42);
        assert_eq!(
            settings.collector.nvidia_smi_path,
            "/opt/nvidia/bin/nvidia-smi"
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_settings_file_sits_between_defaults_and_cli() {
        clear_env();
        let path = std::env::temp_dir().join(format!(
            "gpu-list-exporter-settings-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "server:\n  port: 9500\n  metrics_update_interval: 30\ncollector:\n  timeout: 4\n",
        )
        .unwrap();

        let cli = Cli {
            config: Some(path.to_string_lossy().to_string()),
            interval: Some(60),
            ..Default::default()
        };
        let settings = Settings::new(&cli).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.server.port, 9500);
        assert_eq!(settings.server.metrics_update_interval, 60);
        assert_eq!(settings.collector.timeout, Duration::from_secs(4));
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn test_missing_settings_file_is_an_error() {
        let cli = Cli {
            config: Some("/nonexistent/gpu-list-exporter.yaml".to_string()),
            ..Default::default()
        };
        assert!(Settings::new(&cli).is_err());
    }

    #[test]
    fn test_rejects_non_positive_interval_and_timeout() {
        let zero_interval = Cli {
            interval: Some(0),
            ..Default::default()
        };
        assert!(Settings::new(&zero_interval).is_err());

        let zero_timeout = Cli {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(Settings::new(&zero_timeout).is_err());
    }

    #[test]
    fn test_rejects_port_zero_and_empty_tool_path() {
        let zero_port = Cli {
            port: Some(0),
            ..Default::default()
        };
        assert!(Settings::new(&zero_port).is_err());

        let empty_path = Cli {
            nvidia_smi_path: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(Settings::new(&empty_path).is_err());
    }

    #[test]
    #[serial]
    fn test_timeout_accepts_duration_strings() {
        clear_env();
        unsafe {
            std::env::set_var("EXPORTER_TIMEOUT", "10s");
        }
        let cli = Cli::try_parse_from(["gpu-list-exporter"]).unwrap();
        let settings = Settings::new(&cli).unwrap();
        assert_eq!(settings.collector.timeout, Duration::from_secs(10));
        clear_env();

        let cli = Cli::try_parse_from(["gpu-list-exporter", "--timeout", "500ms"]).unwrap();
        let settings = Settings::new(&cli).unwrap();
        assert_eq!(settings.collector.timeout, Duration::from_millis(500));

        let cli = Cli::try_parse_from(["gpu-list-exporter", "--timeout", "1m30s"]).unwrap();
        assert_eq!(cli.timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 250ms "), Ok(Duration::from_millis(250)));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    #[serial]
    fn test_settings_file_timeout_as_text() {
        clear_env();
        let path = std::env::temp_dir().join(format!(
            "gpu-list-exporter-timeout-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "collector:\n  timeout: 750ms\n").unwrap();

        let cli = Cli {
            config: Some(path.to_string_lossy().to_string()),
            ..Default::default()
        };
        let settings = Settings::new(&cli).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.collector.timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_cli_rejects_negative_interval() {
        assert!(Cli::try_parse_from(["gpu-list-exporter", "--interval", "-5"]).is_err());
    }
}
