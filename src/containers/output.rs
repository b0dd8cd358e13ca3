//! Parsers for runtime CLI output: inspect lines, stats lines, byte sizes
//! and timestamps.
//!
//! Everything in here is total: malformed input degrades to `None` or zero,
//! never to an error. The runtime's output is treated as hostile; a parser
//! that panics on a weird stats line would take the whole manager with it.

use chrono::{DateTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{ContainerInfo, ContainerStats, ContainerStatus};

/// Sentinel the runtime substitutes for missing template fields.
pub const NO_VALUE: &str = "<no value>";

/// Inspect template; [`parse_inspect_line`] depends on this field order.
pub const INSPECT_FORMAT: &str = "{{.Id}}|{{.Name}}|{{.Config.Image}}|{{.State.Status}}|{{.Created}}|{{.State.StartedAt}}|{{.State.FinishedAt}}|{{.State.ExitCode}}|{{.State.OOMKilled}}";

/// Stats template matching [`parse_stats_line`].
pub const STATS_FORMAT: &str =
    "{{.Name}}|{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}|{{.NetIO}}|{{.BlockIO}}|{{.PIDs}}";

static BYTE_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([A-Za-z]*)$").unwrap());

/// Parse one line of `inspect --format` output into container metadata.
///
/// Returns `None` when the line does not carry at least the eight expected
/// positional fields. Sentinel timestamps and exit codes map to `None`; an
/// unrecognized status falls back to `exited`.
pub fn parse_inspect_line(line: &str) -> Option<ContainerInfo> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 8 {
        return None;
    }

    Some(ContainerInfo {
        id: fields[0].trim().to_string(),
        name: fields[1].trim().trim_start_matches('/').to_string(),
        image: fields[2].trim().to_string(),
        status: ContainerStatus::from_runtime(fields[3]),
        created_at: parse_timestamp(fields[4]),
        started_at: parse_timestamp(fields[5]),
        finished_at: parse_timestamp(fields[6]),
        exit_code: parse_exit_code(fields[7]),
        oom_killed: fields.get(8).and_then(|field| parse_bool(field)),
    })
}

/// Parse one line of `stats --no-stream --format` output.
///
/// The line must split into exactly seven columns; otherwise `None`.
/// Individually unparsable numbers degrade to zero.
pub fn parse_stats_line(line: &str) -> Option<ContainerStats> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 7 {
        return None;
    }

    let (memory_usage_bytes, memory_limit_bytes) = parse_byte_pair(fields[2]);
    let (network_rx_bytes, network_tx_bytes) = parse_byte_pair(fields[4]);
    let (block_read_bytes, block_write_bytes) = parse_byte_pair(fields[5]);

    Some(ContainerStats {
        cpu_percent: parse_percent(fields[1]),
        memory_usage_bytes,
        memory_limit_bytes,
        memory_percent: parse_percent(fields[3]),
        network_rx_bytes,
        network_tx_bytes,
        block_read_bytes,
        block_write_bytes,
        pids: fields[6].trim().parse().unwrap_or(0),
    })
}

/// Convert a unit-suffixed size ("512MiB", "1.2kB", "800B") to bytes.
///
/// Decimal suffixes are powers of 1000, binary (`i`) suffixes powers of
/// 1024; matching is case-insensitive and a bare number counts as bytes.
/// Unrecognized suffixes and unparsable numbers yield zero.
pub fn parse_byte_size(field: &str) -> u64 {
    let caps = match BYTE_SIZE.captures(field.trim()) {
        Some(caps) => caps,
        None => return 0,
    };
    let value: f64 = match caps[1].parse() {
        Ok(value) => value,
        Err(_) => return 0,
    };
    let multiplier: f64 = match caps[2].to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "p" | "pb" => 1e15,
        "ki" | "kib" => 1024.0,
        "mi" | "mib" => 1024.0 * 1024.0,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "ti" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "pi" | "pib" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };
    (value * multiplier).round() as u64
}

/// RFC3339 timestamp (nanosecond precision as the runtime emits it),
/// truncated to milliseconds. The sentinel and unparsable values map to
/// `None`.
pub fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    let field = field.trim();
    if field.is_empty() || field == NO_VALUE {
        return None;
    }
    let parsed = DateTime::parse_from_rfc3339(field).ok()?;
    let utc = parsed.with_timezone(&Utc);
    utc.with_nanosecond(utc.nanosecond() / 1_000_000 * 1_000_000)
}

fn parse_exit_code(field: &str) -> Option<i64> {
    let field = field.trim();
    if field.is_empty() || field == NO_VALUE {
        return None;
    }
    field.parse().ok()
}

fn parse_bool(field: &str) -> Option<bool> {
    match field.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_percent(field: &str) -> f64 {
    field.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Split an `X / Y` pair and size-parse both halves.
fn parse_byte_pair(field: &str) -> (u64, u64) {
    let mut parts = field.splitn(2, '/');
    let first = parse_byte_size(parts.next().unwrap_or(""));
    let second = parse_byte_size(parts.next().unwrap_or(""));
    (first, second)
}
