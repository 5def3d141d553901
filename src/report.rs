use crate::collectors::{CollectError, CommandRunner, ProcessSource, SystemRunner};
use crate::config::Config;
use crate::host::{HostProbe, SysinfoProbe};
use crate::normalize::{Normalizer, START_TIME_FORMAT};
use crate::record::{round2, Owner, ProcessRecord, UNKNOWN_LITERAL};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// One full snapshot. Built once by `ReportAssembler` and read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    #[serde(rename = "generatedAt")]
    generated_at: String,
    #[serde(rename = "computerName")]
    computer_name: String,
    #[serde(rename = "generatedBy")]
    generated_by: String,
    #[serde(rename = "processCount")]
    process_count: usize,
    #[serde(rename = "uniqueUserCount")]
    unique_user_count: usize,
    records: Vec<ProcessRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerSummary {
    pub owner: Owner,
    #[serde(rename = "processCount")]
    pub process_count: usize,
    #[serde(rename = "totalMemoryMB")]
    pub total_memory_mb: f64,
}

impl Report {
    fn new(
        generated_at: String,
        computer_name: String,
        generated_by: String,
        records: Vec<ProcessRecord>,
    ) -> Self {
        let unique_user_count = records
            .iter()
            .filter(|r| r.owner.is_known())
            .map(|r| &r.owner)
            .collect::<HashSet<_>>()
            .len();
        Self {
            generated_at,
            computer_name,
            generated_by,
            process_count: records.len(),
            unique_user_count,
            records,
        }
    }

    pub fn generated_at(&self) -> &str {
        &self.generated_at
    }

    pub fn computer_name(&self) -> &str {
        &self.computer_name
    }

    pub fn generated_by(&self) -> &str {
        &self.generated_by
    }

    pub fn process_count(&self) -> usize {
        self.process_count
    }

    pub fn unique_user_count(&self) -> usize {
        self.unique_user_count
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    /// Process count and memory per owner, largest memory first.
    /// All ownerless processes share the `Unknown` bucket.
    pub fn owner_summary(&self) -> Vec<OwnerSummary> {
        let mut by_owner: HashMap<&Owner, (usize, f64)> = HashMap::new();
        for record in &self.records {
            let entry = by_owner.entry(&record.owner).or_default();
            entry.0 += 1;
            entry.1 += record.total_memory_mb;
        }

        let mut out: Vec<OwnerSummary> = by_owner
            .into_iter()
            .map(|(owner, (count, memory))| OwnerSummary {
                owner: owner.clone(),
                process_count: count,
                total_memory_mb: round2(memory),
            })
            .collect();
        out.sort_by(|a, b| {
            b.total_memory_mb
                .total_cmp(&a.total_memory_mb)
                .then_with(|| a.owner.cmp(&b.owner))
        });
        out
    }

    pub fn top_by_memory(&self, n: usize) -> Vec<&ProcessRecord> {
        let mut sorted: Vec<&ProcessRecord> = self.records.iter().collect();
        sorted.sort_by(|a, b| {
            b.total_memory_mb
                .total_cmp(&a.total_memory_mb)
                .then_with(|| a.pid.cmp(&b.pid))
        });
        sorted.truncate(n);
        sorted
    }
}

/// Diagnostics for one collection pass.
#[derive(Debug, Clone, Default)]
pub struct CollectStats {
    pub source: &'static str,
    pub skipped_lines: u64,
    pub cpu_time_fallbacks: u64,
    pub field_fallbacks: BTreeMap<&'static str, u64>,
    pub duplicate_pids: u64,
    pub total_memory_known: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("process collection failed: {0}")]
    CollectionFailed(#[source] CollectError),
}

impl ReportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReportError::CollectionFailed(inner) => inner.kind(),
        }
    }
}

pub struct ReportAssembler<R: CommandRunner, H: HostProbe> {
    source: ProcessSource<R>,
    host: H,
}

impl ReportAssembler<SystemRunner, SysinfoProbe> {
    /// Picks the collector for the running OS.
    pub fn for_current_platform(cfg: &Config) -> Result<Self, ReportError> {
        let source = ProcessSource::detect(Arc::new(SystemRunner), cfg)
            .map_err(ReportError::CollectionFailed)?;
        Ok(Self::new(source, SysinfoProbe))
    }
}

impl<R: CommandRunner, H: HostProbe> ReportAssembler<R, H> {
    pub fn new(source: ProcessSource<R>, host: H) -> Self {
        Self { source, host }
    }

    pub async fn run(&self) -> Result<Report, ReportError> {
        self.run_with_stats().await.map(|(report, _)| report)
    }

    pub async fn run_with_stats(&self) -> Result<(Report, CollectStats), ReportError> {
        let started = Instant::now();
        let batch = self
            .source
            .list_processes()
            .await
            .map_err(ReportError::CollectionFailed)?;

        let total_memory_bytes = self.host.total_memory_bytes();
        if total_memory_bytes.is_none() {
            warn!("total system memory unknown, memory percentages will be 0");
        }
        let normalizer = Normalizer::new(total_memory_bytes);

        let mut stats = CollectStats {
            source: self.source.name(),
            skipped_lines: batch.skipped_lines,
            cpu_time_fallbacks: batch.cpu_time_fallbacks,
            total_memory_known: total_memory_bytes.is_some(),
            ..CollectStats::default()
        };

        let mut seen = HashSet::with_capacity(batch.entries.len());
        let mut records = Vec::with_capacity(batch.entries.len());
        for raw in &batch.entries {
            if !seen.insert(raw.pid) {
                stats.duplicate_pids += 1;
                warn!(pid = raw.pid, name = %raw.name, "duplicate pid in listing, keeping first entry");
                continue;
            }
            let normalized = normalizer.normalize(raw);
            for field in normalized.degraded_fields {
                *stats.field_fallbacks.entry(field).or_default() += 1;
            }
            records.push(normalized.record);
        }

        if records.is_empty() {
            return Err(ReportError::CollectionFailed(CollectError::Empty));
        }

        let report = Report::new(
            chrono::Local::now().format(START_TIME_FORMAT).to_string(),
            self.host
                .host_name()
                .unwrap_or_else(|| UNKNOWN_LITERAL.to_string()),
            self.host
                .current_user()
                .unwrap_or_else(|| UNKNOWN_LITERAL.to_string()),
            records,
        );

        stats.elapsed = started.elapsed();
        info!(
            source = stats.source,
            processes = report.process_count(),
            users = report.unique_user_count(),
            skipped_lines = stats.skipped_lines,
            elapsed = %humantime::format_duration(Duration::from_millis(stats.elapsed.as_millis() as u64)),
            "process snapshot assembled"
        );

        Ok((report, stats))
    }
}
