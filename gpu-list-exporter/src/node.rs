//! Node identity: the hostname used as a metric label and the OS image
//! details behind the system info gauge.

use std::collections::HashMap;

use chrono::Utc;
use gpu_list_exporter_common::SystemImageInfo;
use log::debug;
use sysinfo::System;

const OS_RELEASE_PATH: &str = "/etc/os-release";
const UNKNOWN: &str = "unknown";

/// Resolve the hostname label.
///
/// Order: explicit override, `NODE_NAME` (set by the orchestrator), the OS
/// hostname, then `unknown`. Blank candidates are ignored.
pub fn resolve_hostname(override_name: Option<&str>) -> String {
    let node_name = std::env::var("NODE_NAME").ok();
    pick_hostname(override_name, node_name.as_deref(), os_hostname().as_deref())
}

fn pick_hostname(
    override_name: Option<&str>,
    node_name: Option<&str>,
    os_name: Option<&str>,
) -> String {
    [override_name, node_name, os_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

pub fn os_hostname() -> Option<String> {
    non_blank(System::host_name())
}

/// Kernel release, e.g. `5.15.0-105-generic`.
pub fn kernel_release() -> Option<String> {
    non_blank(System::kernel_version())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `KEY=VALUE` lines of an os-release file. Quotes around values are
/// stripped; comments and malformed lines are ignored.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn system_image_info(
    hostname: &str,
    os_release: &HashMap<String, String>,
    kernel: Option<String>,
) -> SystemImageInfo {
    let field = |key: &str| {
        os_release
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    };

    SystemImageInfo {
        hostname: hostname.to_string(),
        timestamp: Utc::now(),
        os_version: field("PRETTY_NAME").unwrap_or_else(|| UNKNOWN.to_string()),
        kernel_version: kernel.unwrap_or_else(|| UNKNOWN.to_string()),
        boot_image_version: field("IMAGE_VERSION")
            .or_else(|| field("BUILD_ID"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

/// Gather OS image details for this node. Missing sources degrade to `unknown`.
pub fn read_system_image_info(hostname: &str) -> SystemImageInfo {
    let mut os_release = match std::fs::read_to_string(OS_RELEASE_PATH) {
        Ok(content) => parse_os_release(&content),
        Err(e) => {
            debug!("Cannot read {}: {}", OS_RELEASE_PATH, e);
            HashMap::new()
        }
    };
    if !os_release.contains_key("PRETTY_NAME")
        && let Some(long_name) = non_blank(System::long_os_version())
    {
        os_release.insert("PRETTY_NAME".to_string(), long_name);
    }
    system_image_info(hostname, &os_release, kernel_release())
}
