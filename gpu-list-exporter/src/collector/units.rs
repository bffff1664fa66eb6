//! Normalization of nvidia-smi cell values.
//!
//! nvidia-smi decorates numbers with units and prints sentinels for sensors a
//! board does not expose. Sentinels mean "deliberately unavailable" and become
//! zero; anything else that still fails to parse after stripping units is an
//! error so the caller can drop the row.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// `2024/01/01 12:00:00.000`
const SMI_TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

const SENTINELS: [&str; 3] = ["", "N/A", "[Not Supported]"];

const FLOAT_SUFFIXES: [&str; 5] = ["%", "℃", "°", "C", "W"];

// Longer tokens first so "MiB" is not left as "Mi" after stripping "B".
const MEMORY_SUFFIXES: [&str; 6] = ["MiB", "GiB", "KiB", "MB", "GB", "KB"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid numeric cell {0:?}")]
pub struct InvalidNumber(pub String);

fn is_sentinel(cell: &str) -> bool {
    SENTINELS.contains(&cell)
}

fn strip_suffixes(cell: &str, suffixes: &[&str]) -> String {
    suffixes
        .iter()
        .fold(cell.to_string(), |acc, suffix| acc.replace(suffix, ""))
        .trim()
        .to_string()
}

/// Percentages, temperatures and wattages.
pub fn parse_float(cell: &str) -> Result<f64, InvalidNumber> {
    let cell = cell.trim();
    if is_sentinel(cell) {
        return Ok(0.0);
    }

    let stripped = strip_suffixes(cell, &FLOAT_SUFFIXES);
    match stripped.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(InvalidNumber(cell.to_string())),
    }
}

/// Memory figures in whole units; the unit itself is discarded, not scaled.
pub fn parse_uint(cell: &str) -> Result<u64, InvalidNumber> {
    let cell = cell.trim();
    if is_sentinel(cell) {
        return Ok(0);
    }

    strip_suffixes(cell, &MEMORY_SUFFIXES)
        .parse::<u64>()
        .map_err(|_| InvalidNumber(cell.to_string()))
}

/// nvidia-smi prints local wall-clock time. A corrupt timestamp never costs
/// the row: it falls back to now.
pub fn parse_timestamp(cell: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(cell.trim(), SMI_TIMESTAMP_FORMAT)
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
