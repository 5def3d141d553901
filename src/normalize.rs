use crate::collectors::{MemoryUnit, ParseError, RawCpuTime, RawProcess};
use crate::record::{round2, Owner, ProcessRecord, Reading};
use chrono::NaiveDateTime;
use tracing::warn;

pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: ProcessRecord,
    /// Fields whose raw value was malformed and replaced by a sentinel.
    pub degraded_fields: Vec<&'static str>,
}

/// Maps raw platform entries onto `ProcessRecord`. Holds the total system
/// memory read for the current snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    total_memory_bytes: Option<u64>,
}

impl Normalizer {
    pub fn new(total_memory_bytes: Option<u64>) -> Self {
        Self { total_memory_bytes }
    }

    pub fn normalize(&self, raw: &RawProcess) -> Normalized {
        let mut fields = FieldLog::new(raw.pid);

        let cpu_time_seconds = match &raw.cpu_time {
            RawCpuTime::NotApplicable => 0.0,
            RawCpuTime::Seconds(text) if is_not_applicable(text) => 0.0,
            RawCpuTime::Seconds(text) => fields
                .check("cpuTimeSeconds", text, parse_decimal(text))
                .unwrap_or(0.0),
            RawCpuTime::Clock(text) => fields
                .check("cpuTimeSeconds", text, parse_clock(text))
                .unwrap_or(0.0),
        };

        let cpu_percentage: Reading<f64> = match raw.cpu_percent.as_deref() {
            None => Reading::NotAvailable,
            Some(text) if is_not_applicable(text) => Reading::NotAvailable,
            Some(text) => fields
                .check("cpuPercentage", text, parse_decimal(text))
                .map(round2)
                .into(),
        };

        let working_set_bytes =
            fields.memory_bytes("workingSetMB", raw.working_set.as_deref(), raw.memory_unit);
        let paged_bytes =
            fields.memory_bytes("pagedMemoryMB", raw.paged_memory.as_deref(), raw.memory_unit);
        let working_set_mb = round2(working_set_bytes / BYTES_PER_MB);
        let paged_memory_mb = round2(paged_bytes / BYTES_PER_MB);

        let memory_percentage = match self.total_memory_bytes {
            Some(total) if total > 0 => {
                round2(100.0 * (working_set_bytes + paged_bytes) / total as f64)
            }
            _ => 0.0,
        };

        let start_time: Reading<String> = match raw.start_time.as_deref().map(str::trim) {
            None | Some("") => Reading::NotAvailable,
            Some(text) => fields
                .check("startTime", text, parse_start_time(text))
                .into(),
        };

        let path: Reading<String> = raw
            .path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .into();

        let record = ProcessRecord {
            pid: raw.pid,
            process_name: raw.name.trim().to_string(),
            owner: Owner::from_raw(raw.owner.as_deref()),
            cpu_time_seconds: round2(cpu_time_seconds),
            cpu_percentage,
            working_set_mb,
            paged_memory_mb,
            total_memory_mb: round2(working_set_mb + paged_memory_mb),
            memory_percentage,
            handle_count: fields.count("handleCount", raw.handle_count.as_deref()),
            thread_count: fields.count("threadCount", raw.thread_count.as_deref()),
            start_time,
            path,
        };

        Normalized {
            record,
            degraded_fields: fields.degraded,
        }
    }
}

struct FieldLog {
    pid: u32,
    degraded: Vec<&'static str>,
}

impl FieldLog {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            degraded: Vec::new(),
        }
    }

    fn check<T>(&mut self, field: &'static str, raw: &str, parsed: Option<T>) -> Option<T> {
        if parsed.is_none() {
            let err = ParseError::Field {
                field,
                value: raw.to_string(),
            };
            warn!(pid = self.pid, error = %err, "field replaced by sentinel");
            self.degraded.push(field);
        }
        parsed
    }

    fn memory_bytes(&mut self, field: &'static str, raw: Option<&str>, unit: MemoryUnit) -> f64 {
        match raw {
            None => 0.0,
            Some(text) if is_not_applicable(text) => 0.0,
            Some(text) => self
                .check(field, text, parse_decimal(text))
                .map(|amount| unit.to_bytes(amount))
                .unwrap_or(0.0),
        }
    }

    fn count(&mut self, field: &'static str, raw: Option<&str>) -> u64 {
        match raw {
            None => 0,
            Some(text) if is_not_applicable(text) => 0,
            Some(text) => self
                .check(field, text, text.trim().parse::<u64>().ok())
                .unwrap_or(0),
        }
    }
}

fn is_not_applicable(text: &str) -> bool {
    let t = text.trim();
    t.is_empty() || t == "-" || t.eq_ignore_ascii_case("n/a") || t.eq_ignore_ascii_case("na")
}

/// Non-negative finite decimal. A comma is read as the decimal mark only
/// when it is the sole separator and at most two digits follow it, so
/// thousands-grouped text such as `1,234` is rejected.
pub fn parse_decimal(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    let value = match trimmed.parse::<f64>() {
        Ok(value) => value,
        Err(_) => {
            let (int, frac) = trimmed.split_once(',')?;
            let decimal_comma = !trimmed.contains('.')
                && !frac.contains(',')
                && (1..=2).contains(&frac.len())
                && frac.chars().all(|c| c.is_ascii_digit());
            if !decimal_comma {
                return None;
            }
            format!("{int}.{frac}").parse::<f64>().ok()?
        }
    };
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// `ps` cumulative time: `[[dd-]hh:]mm:ss[.ff]`.
pub fn parse_clock(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    let (days, clock) = match trimmed.split_once('-') {
        Some((days, rest)) => (days.parse::<u64>().ok()?, rest),
        None => (0, trimmed),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => (0, m.parse::<u64>().ok()?, *s),
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, *s),
        _ => return None,
    };
    if !seconds.chars().all(|c| c.is_ascii_digit() || c == '.') || seconds.is_empty() {
        return None;
    }
    let seconds = seconds.parse::<f64>().ok()?;

    let whole = days
        .checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes.checked_mul(60)?)?;
    Some(whole as f64 + seconds)
}

/// Accepts `yyyy-MM-dd HH:mm:ss` or `ps lstart` text (`Wed Oct 14 09:15:44 2026`).
pub fn parse_start_time(input: &str) -> Option<String> {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(ts) = NaiveDateTime::parse_from_str(&collapsed, START_TIME_FORMAT) {
        return Some(ts.format(START_TIME_FORMAT).to_string());
    }

    // lstart leads with a weekday name; drop it so a mismatch cannot reject the date.
    let without_weekday = match collapsed.split_once(' ') {
        Some((first, rest)) if first.chars().all(|c| c.is_ascii_alphabetic()) => rest,
        _ => collapsed.as_str(),
    };
    NaiveDateTime::parse_from_str(without_weekday, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|ts| ts.format(START_TIME_FORMAT).to_string())
}
