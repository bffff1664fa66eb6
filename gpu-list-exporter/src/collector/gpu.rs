use gpu_list_exporter_common::{GpuIndex, GpuSnapshot};
use log::debug;

use super::{
    CollectError,
    units::{InvalidNumber, parse_float, parse_timestamp, parse_uint},
};

/// Column order of the device query; the parser depends on it.
pub const GPU_QUERY_FIELDS: &str = "timestamp,index,name,memory.free,memory.used,memory.total,utilization.gpu,utilization.memory,temperature.gpu";

const GPU_QUERY_COLUMNS: usize = 9;

/// Build a CSV reader for nvidia-smi's `--format=csv,noheader` output.
///
/// Records are flexible so a short or long row surfaces as a length mismatch
/// for the caller to judge instead of aborting the whole read.
fn smi_csv_reader(output: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(output)
}

/// Iterate the records of nvidia-smi CSV output.
///
/// A row that is not valid UTF-8 is logged and skipped; the reader resumes at
/// the next row. Other read errors are passed through.
pub(crate) fn smi_records(
    output: &[u8],
) -> impl Iterator<Item = Result<csv::StringRecord, csv::Error>> + '_ {
    smi_csv_reader(output)
        .into_records()
        .filter(|record| match record {
            Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => {
                debug!("Skipping row with invalid UTF-8: {}", e);
                false
            }
            _ => true,
        })
}

/// Parse the device query output into one snapshot per well-formed row.
///
/// Rows with the wrong column count or an unparsable number are dropped and
/// do not affect their siblings. Only a CSV-level read error fails the batch.
pub fn parse_gpu_metrics(output: &[u8], hostname: &str) -> Result<Vec<GpuSnapshot>, CollectError> {
    let mut snapshots = Vec::new();

    for (line, record) in smi_records(output).enumerate() {
        let record = record?;
        if record.len() != GPU_QUERY_COLUMNS {
            debug!(
                "Skipping GPU row {}: expected {} columns, found {}",
                line + 1,
                GPU_QUERY_COLUMNS,
                record.len()
            );
            continue;
        }

        let fields: Vec<&str> = record.iter().collect();
        match parse_gpu_row(&fields, hostname) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => debug!("Skipping GPU row {}: {}", line + 1, e),
        }
    }

    Ok(snapshots)
}

fn parse_gpu_row(fields: &[&str], hostname: &str) -> Result<GpuSnapshot, InvalidNumber> {
    let gpu_id: GpuIndex = fields[1]
        .parse()
        .map_err(|_| InvalidNumber(fields[1].to_string()))?;

    let gpu_name = match fields[2] {
        "" => "unknown".to_string(),
        name => name.to_string(),
    };

    Ok(GpuSnapshot {
        hostname: hostname.to_string(),
        gpu_id,
        timestamp: parse_timestamp(fields[0]),
        gpu_name,
        free_memory: parse_uint(fields[3])?,
        used_memory: parse_uint(fields[4])?,
        total_memory: parse_uint(fields[5])?,
        gpu_utilization: parse_float(fields[6])?,
        memory_utilization: parse_float(fields[7])?,
        temperature: parse_float(fields[8])?,
    })
}
