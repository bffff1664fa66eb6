//! Per-process GPU accounting.
//!
//! nvidia-smi only knows the GPU, PID, name and GPU memory of a compute
//! process; owner and CPU/RSS usage come from `ps`. The two lookups are not
//! atomic, so a process may exit between them. Such rows keep their GPU memory
//! figures and get placeholder OS fields.
//!
//! Stage one and two produce one joined text line per process:
//!
//! ```text
//! timestamp, gpu_uuid, pid, process_name, used_gpu_memory, user, %mem, %cpu, command
//! ```
//!
//! which [`parse_processes`] then turns into typed records.

use std::time::Duration;

use gpu_list_exporter_common::GpuProcess;
use log::{debug, warn};

use super::{
    CollectError,
    gpu::smi_records,
    shell::ShellCommand,
    units::{InvalidNumber, parse_float, parse_timestamp, parse_uint},
    uuid_index::UuidIndex,
};

pub const COMPUTE_APPS_QUERY_FIELDS: &str = "timestamp,gpu_uuid,pid,process_name,used_gpu_memory";

const COMPUTE_APPS_COLUMNS: usize = 5;

const JOINED_FIELDS: usize = 9;

/// Longest command label kept before truncation.
pub const MAX_COMMAND_LEN: usize = 1024;

pub const TRUNCATION_MARKER: &str = "...";

pub const UNKNOWN_USER: &str = "unknown";

const PS_PROGRAM: &str = "ps";

const PS_COLUMNS: &str = "user,%mem,%cpu,command";

const COMMA_ESCAPE: &str = "%2C";

const PERCENT_ESCAPE: &str = "%25";

/// Markers nvidia-smi prints instead of a process row.
const NOT_FOUND_MARKERS: [&str; 2] = ["Not Found", "No running processes found"];

/// One row of the compute-apps query, kept as text for the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeApp {
    pub timestamp: String,
    pub gpu_uuid: String,
    pub pid: u32,
    pub process_name: String,
    pub used_gpu_memory: String,
}

/// OS-level view of a PID, as printed by `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsProcessInfo {
    pub user: String,
    pub memory_percent: String,
    pub cpu_percent: String,
    pub command: String,
}

/// Parse the compute-apps query. Rows that are not process rows, or whose PID
/// is not a positive integer, are skipped.
pub fn parse_compute_apps(output: &[u8]) -> Result<Vec<ComputeApp>, CollectError> {
    let mut apps = Vec::new();

    for record in smi_records(output) {
        let record = record?;
        if record
            .iter()
            .any(|cell| NOT_FOUND_MARKERS.iter().any(|m| cell.contains(m)))
        {
            continue;
        }
        if record.len() < COMPUTE_APPS_COLUMNS {
            warn!(
                "Skipping compute-apps row with {} columns: {:?}",
                record.len(),
                record
            );
            continue;
        }

        let pid = match record[2].parse::<u32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                warn!("Skipping compute-apps row with invalid pid {:?}", &record[2]);
                continue;
            }
        };

        // Fields are not quoted, so a comma in the process name splits it
        // across cells. Memory is always the last cell.
        let last = record.len() - 1;
        let process_name = record
            .iter()
            .skip(3)
            .take(last - 3)
            .collect::<Vec<_>>()
            .join(",");

        apps.push(ComputeApp {
            timestamp: record[0].to_string(),
            gpu_uuid: record[1].to_string(),
            pid,
            process_name,
            used_gpu_memory: record[last].to_string(),
        });
    }

    Ok(apps)
}

pub fn ps_command(pid: u32, timeout: Duration) -> ShellCommand {
    ShellCommand::new(
        PS_PROGRAM,
        [
            "--no-headers".to_string(),
            "-o".to_string(),
            PS_COLUMNS.to_string(),
            "-p".to_string(),
            pid.to_string(),
        ],
        timeout,
    )
}

/// Parse `ps -o user,%mem,%cpu,command` output for a single PID.
///
/// Returns `None` when there is no process line, i.e. the PID is gone.
pub fn parse_ps_output(output: &[u8]) -> Option<OsProcessInfo> {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().find(|l| !l.trim().is_empty())?;

    let mut tokens = line.split_whitespace();
    let user = tokens.next()?.to_string();
    // Some locales print decimal commas, which would break the joined row.
    let memory_percent = tokens.next()?.replace(',', ".");
    let cpu_percent = tokens.next()?.replace(',', ".");
    let command = tokens.collect::<Vec<_>>().join(" ");

    Some(OsProcessInfo {
        user,
        memory_percent,
        cpu_percent,
        command,
    })
}

/// Join a compute-apps row with its `ps` lookup into one 9-field line.
///
/// Without a lookup the row still emits: user `unknown`, zero usage and the
/// process name as command. Commas in the process name are escaped so the
/// line keeps exactly nine fields; the command is last and needs no escaping.
pub fn join_row(app: &ComputeApp, info: Option<&OsProcessInfo>) -> String {
    let (user, memory_percent, cpu_percent, command) = match info {
        Some(info) => (
            info.user.as_str(),
            info.memory_percent.as_str(),
            info.cpu_percent.as_str(),
            info.command.as_str(),
        ),
        None => (UNKNOWN_USER, "0.0", "0.0", app.process_name.as_str()),
    };

    format!(
        "{}, {}, {}, {}, {}, {}, {}, {}, {}",
        app.timestamp,
        app.gpu_uuid,
        app.pid,
        escape_field(&app.process_name),
        app.used_gpu_memory,
        user,
        memory_percent,
        cpu_percent,
        command
    )
}

/// Parse joined process lines.
///
/// Field count is strict: these lines were built by [`join_row`], so a short
/// line is a pipeline bug and fails the whole batch. Value-level parse errors
/// only skip the row.
pub fn parse_processes(
    joined: &str,
    index: &UuidIndex,
    hostname: &str,
) -> Result<Vec<GpuProcess>, CollectError> {
    let mut processes = Vec::new();

    for (line_no, line) in joined.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        // The command is last, so commas inside it stay in that field.
        let fields: Vec<&str> = line.splitn(JOINED_FIELDS, ',').map(str::trim).collect();
        if fields.len() != JOINED_FIELDS {
            return Err(CollectError::MalformedRow {
                line: line_no + 1,
                fields: fields.len(),
            });
        }

        match parse_process_row(&fields, index, hostname) {
            Ok(process) => processes.push(process),
            Err(e) => warn!("Skipping process row {}: {}", line_no + 1, e),
        }
    }

    Ok(processes)
}

fn parse_process_row(
    fields: &[&str],
    index: &UuidIndex,
    hostname: &str,
) -> Result<GpuProcess, InvalidNumber> {
    let pid = match fields[2].parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => return Err(InvalidNumber(fields[2].to_string())),
    };

    let process_name = non_empty_or(&unescape_field(fields[3]), "unknown");
    let command = match fields[8] {
        "" => process_name.clone(),
        command => truncate_command(command),
    };

    Ok(GpuProcess {
        hostname: hostname.to_string(),
        gpu_id: index.resolve(fields[1]),
        timestamp: parse_timestamp(fields[0]),
        user: non_empty_or(fields[5], UNKNOWN_USER),
        pid,
        used_gpu_memory: parse_uint(fields[4])?,
        used_memory: parse_float(fields[6])?,
        used_cpu: parse_float(fields[7])?,
        process_name,
        command,
    })
}

fn escape_field(value: &str) -> String {
    value
        .replace('%', PERCENT_ESCAPE)
        .replace(',', COMMA_ESCAPE)
}

fn unescape_field(value: &str) -> String {
    value
        .replace(COMMA_ESCAPE, ",")
        .replace(PERCENT_ESCAPE, "%")
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Bound a command line to [`MAX_COMMAND_LEN`] characters plus a marker.
pub fn truncate_command(command: &str) -> String {
    if command.chars().count() <= MAX_COMMAND_LEN {
        return command.to_string();
    }

    debug!(
        "Truncating command of {} chars to {}",
        command.chars().count(),
        MAX_COMMAND_LEN
    );
    let mut truncated: String = command.chars().take(MAX_COMMAND_LEN).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> UuidIndex {
        UuidIndex::parse(b"0, GPU-aaaa\n1, GPU-bbbb\n").unwrap()
    }

    fn app(pid: u32, uuid: &str, name: &str) -> ComputeApp {
        ComputeApp {
            timestamp: "2024/01/01 12:00:00.000".to_string(),
            gpu_uuid: uuid.to_string(),
            pid,
            process_name: name.to_string(),
            used_gpu_memory: "512 MiB".to_string(),
        }
    }

    #[test]
    fn test_parse_compute_apps() {
        let output = "2024/01/01 12:00:00.000, GPU-aaaa, 4242, python, 512 MiB\n\
                      2024/01/01 12:00:00.000, GPU-bbbb, 77, /usr/bin/trainer, 1024 MiB\n";
        let apps = parse_compute_apps(output.as_bytes()).unwrap();

        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].pid, 4242);
        assert_eq!(apps[0].gpu_uuid, "GPU-aaaa");
        assert_eq!(apps[1].process_name, "/usr/bin/trainer");
        assert_eq!(apps[1].used_gpu_memory, "1024 MiB");
    }

    #[test]
    fn test_parse_compute_apps_skips_markers_and_bad_pids() {
        let output = "No running processes found\n\
                      2024/01/01 12:00:00.000, GPU-aaaa, [Not Found], python, 512 MiB\n\
                      2024/01/01 12:00:00.000, GPU-aaaa, 0, python, 512 MiB\n\
                      2024/01/01 12:00:00.000, GPU-aaaa, abc, python, 512 MiB\n\
                      2024/01/01 12:00:00.000, GPU-aaaa, 9, python, 1 MiB\n";
        let apps = parse_compute_apps(output.as_bytes()).unwrap();

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].pid, 9);
    }

    #[test]
    fn test_parse_compute_apps_rejoins_comma_in_process_name() {
        let output = "2024/01/01 12:00:00.000, GPU-aaaa, 4242, /opt/app,v2/bin/srv, 512 MiB\n\
                      2024/01/01 12:00:00.000, GPU-bbbb, 77, a,b,c, 64 MiB\n";
        let apps = parse_compute_apps(output.as_bytes()).unwrap();

        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].process_name, "/opt/app,v2/bin/srv");
        assert_eq!(apps[0].used_gpu_memory, "512 MiB");
        assert_eq!(apps[1].process_name, "a,b,c");
        assert_eq!(apps[1].used_gpu_memory, "64 MiB");
    }

    #[test]
    fn test_parse_compute_apps_skips_short_rows() {
        let output = "2024/01/01 12:00:00.000, GPU-aaaa, 4242, python\n";
        assert!(parse_compute_apps(output.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_comma_in_process_name_keeps_memory_accounting() {
        let apps = parse_compute_apps(
            b"2024/01/01 12:00:00.000, GPU-bbbb, 4242, /opt/app,v2/bin/srv, 512 MiB\n",
        )
        .unwrap();
        let joined = format!(
            "{}\n{}",
            join_row(&apps[0], None),
            join_row(&app(7, "GPU-aaaa", "100%,x"), None)
        );
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();

        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 4242);
        assert_eq!(processes[0].gpu_id, 1);
        assert_eq!(processes[0].used_gpu_memory, 512);
        assert_eq!(processes[0].process_name, "/opt/app,v2/bin/srv");
        assert_eq!(processes[0].command, "/opt/app,v2/bin/srv");
        assert_eq!(processes[0].user, "unknown");
        assert_eq!(processes[1].process_name, "100%,x");
        assert_eq!(processes[1].used_gpu_memory, 512);
    }

    #[test]
    fn test_invalid_utf8_compute_app_row_is_skipped() {
        let output = b"2024/01/01 12:00:00.000, GPU-aaaa, 1, caf\xE9, 8 MiB\n\
                       2024/01/01 12:00:00.000, GPU-aaaa, 2, python, 8 MiB\n";
        let apps = parse_compute_apps(output).unwrap();

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].pid, 2);
    }

    #[test]
    fn test_parse_ps_output() {
        let info = parse_ps_output(b"alice     1.5 98.0 python train.py --epochs 3\n").unwrap();
        assert_eq!(info.user, "alice");
        assert_eq!(info.memory_percent, "1.5");
        assert_eq!(info.cpu_percent, "98.0");
        assert_eq!(info.command, "python train.py --epochs 3");
    }

    #[test]
    fn test_parse_ps_output_normalizes_decimal_commas() {
        let info = parse_ps_output(b"bob 0,5 12,0 /opt/app\n").unwrap();
        assert_eq!(info.memory_percent, "0.5");
        assert_eq!(info.cpu_percent, "12.0");
    }

    #[test]
    fn test_parse_ps_output_empty_means_gone() {
        assert!(parse_ps_output(b"").is_none());
        assert!(parse_ps_output(b"\n  \n").is_none());
    }

    #[test]
    fn test_joined_row_round_trips_to_record() {
        let info = OsProcessInfo {
            user: "alice".to_string(),
            memory_percent: "1.5".to_string(),
            cpu_percent: "98.0".to_string(),
            command: "python train.py".to_string(),
        };
        let joined = join_row(&app(4242, "GPU-bbbb", "python"), Some(&info));
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();

        assert_eq!(processes.len(), 1);
        let p = &processes[0];
        assert_eq!(p.hostname, "node-a");
        assert_eq!(p.gpu_id, 1);
        assert_eq!(p.pid, 4242);
        assert_eq!(p.user, "alice");
        assert_eq!(p.used_gpu_memory, 512);
        assert_eq!(p.used_memory, 1.5);
        assert_eq!(p.used_cpu, 98.0);
        assert_eq!(p.command, "python train.py");
    }

    #[test]
    fn test_failed_lookup_emits_placeholder_record() {
        let joined = join_row(&app(31337, "GPU-aaaa", "ghost"), None);
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();

        assert_eq!(processes.len(), 1);
        let p = &processes[0];
        assert_eq!(p.user, "unknown");
        assert_eq!(p.used_cpu, 0.0);
        assert_eq!(p.used_memory, 0.0);
        assert_eq!(p.command, "ghost");
        assert_eq!(p.used_gpu_memory, 512);
    }

    #[test]
    fn test_short_joined_row_fails_whole_batch() {
        let good = join_row(&app(1, "GPU-aaaa", "ok"), None);
        let joined = format!("{}\n2024/01/01 12:00:00.000, GPU-aaaa, 2, short\n", good);

        let err = parse_processes(&joined, &index(), "node-a").unwrap_err();
        assert!(matches!(
            err,
            CollectError::MalformedRow { line: 2, fields: 4 }
        ));
    }

    #[test]
    fn test_commas_in_command_are_kept() {
        let info = OsProcessInfo {
            user: "alice".to_string(),
            memory_percent: "0.1".to_string(),
            cpu_percent: "0.2".to_string(),
            command: "python -c print(1,2,3)".to_string(),
        };
        let joined = join_row(&app(5, "GPU-aaaa", "python"), Some(&info));
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();

        assert_eq!(processes[0].command, "python -c print(1,2,3)");
    }

    #[test]
    fn test_unknown_uuid_resolves_to_gpu_zero() {
        let joined = join_row(&app(5, "GPU-zzzz", "python"), None);
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();
        assert_eq!(processes[0].gpu_id, 0);
    }

    #[test]
    fn test_bad_value_skips_only_that_row() {
        let mut bad = app(6, "GPU-aaaa", "python");
        bad.used_gpu_memory = "many MiB".to_string();
        let joined = format!(
            "{}\n{}\n",
            join_row(&bad, None),
            join_row(&app(7, "GPU-bbbb", "python"), None)
        );
        let processes = parse_processes(&joined, &index(), "node-a").unwrap();

        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 7);
    }

    #[test]
    fn test_long_command_is_truncated_with_marker() {
        let long = "x".repeat(MAX_COMMAND_LEN + 100);
        let truncated = truncate_command(&long);

        assert_eq!(
            truncated.chars().count(),
            MAX_COMMAND_LEN + TRUNCATION_MARKER.len()
        );
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(truncate_command("short"), "short");
    }

    #[test]
    fn test_ps_command_arguments() {
        let cmd = ps_command(42, Duration::from_secs(3));
        assert_eq!(cmd.program, "ps");
        assert_eq!(cmd.args.last().map(String::as_str), Some("42"));
        assert!(cmd.args.contains(&"user,%mem,%cpu,command".to_string()));
    }
}
