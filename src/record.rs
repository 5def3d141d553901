use serde::ser::Serializer;
use serde::Serialize;
use std::fmt;

pub const UNKNOWN_LITERAL: &str = "Unknown";
pub const NOT_AVAILABLE_LITERAL: &str = "N/A";

/// Process owner. Ownerless processes all land in the `Unknown` bucket,
/// including a raw owner spelled exactly like the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Known(String),
    Unknown,
}

impl Owner {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(name) if !name.is_empty() && name != UNKNOWN_LITERAL => {
                Owner::Known(name.to_string())
            }
            _ => Owner::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Owner::Known(name) => name,
            Owner::Unknown => UNKNOWN_LITERAL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Owner::Known(_))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A value the platform may not be able to report.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    Value(T),
    NotAvailable,
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Reading::NotAvailable, Reading::Value)
    }
}

impl<T: fmt::Display> fmt::Display for Reading<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value(v) => v.fmt(f),
            Reading::NotAvailable => f.write_str(NOT_AVAILABLE_LITERAL),
        }
    }
}

impl<T: Serialize> Serialize for Reading<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Value(v) => v.serialize(serializer),
            Reading::NotAvailable => serializer.serialize_str(NOT_AVAILABLE_LITERAL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    #[serde(rename = "processName")]
    pub process_name: String,
    pub owner: Owner,
    #[serde(rename = "cpuTimeSeconds")]
    pub cpu_time_seconds: f64,
    #[serde(rename = "cpuPercentage")]
    pub cpu_percentage: Reading<f64>,
    #[serde(rename = "workingSetMB")]
    pub working_set_mb: f64,
    #[serde(rename = "pagedMemoryMB")]
    pub paged_memory_mb: f64,
    #[serde(rename = "totalMemoryMB")]
    pub total_memory_mb: f64,
    #[serde(rename = "memoryPercentage")]
    pub memory_percentage: f64,
    #[serde(rename = "handleCount")]
    pub handle_count: u64,
    #[serde(rename = "threadCount")]
    pub thread_count: u64,
    #[serde(rename = "startTime")]
    pub start_time: Reading<String>,
    pub path: Reading<String>,
}

pub const RECORD_FIELDS: [&str; 13] = [
    "pid",
    "processName",
    "owner",
    "cpuTimeSeconds",
    "cpuPercentage",
    "workingSetMB",
    "pagedMemoryMB",
    "totalMemoryMB",
    "memoryPercentage",
    "handleCount",
    "threadCount",
    "startTime",
    "path",
];

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
