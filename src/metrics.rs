use crate::report::{CollectStats, Report};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Metrics {
    registry: Registry,
    pub records: Gauge,
    pub unique_users: Gauge,
    pub skipped_lines_total: Counter,
    pub cpu_time_fallbacks_total: Counter,
    pub field_fallbacks_total: CounterVec,
    pub duplicate_pids_total: Counter,
    pub collect_duration_seconds: Gauge,
    pub last_run_timestamp_seconds: Gauge,
    pub collect_errors_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records = Gauge::with_opts(opts!(
            "procreport_records",
            "Process records in the last report"
        ))?;
        let unique_users = Gauge::with_opts(opts!(
            "procreport_unique_users",
            "Distinct known owners in the last report"
        ))?;
        let skipped_lines_total = Counter::with_opts(opts!(
            "procreport_skipped_lines_total",
            "Listing lines that did not match the expected layout"
        ))?;
        let cpu_time_fallbacks_total = Counter::with_opts(opts!(
            "procreport_cpu_time_fallbacks_total",
            "Per-process CPU time lookups that fell back to 0"
        ))?;
        let field_fallbacks_total = CounterVec::new(
            opts!(
                "procreport_field_fallbacks_total",
                "Malformed fields replaced by their sentinel, by field"
            ),
            &["field"],
        )?;
        let duplicate_pids_total = Counter::with_opts(opts!(
            "procreport_duplicate_pids_total",
            "Listing entries dropped because their PID was already seen"
        ))?;
        let collect_duration_seconds = Gauge::with_opts(opts!(
            "procreport_collect_duration_seconds",
            "Wall time of the last collection pass"
        ))?;
        let last_run_timestamp_seconds = Gauge::with_opts(opts!(
            "procreport_last_run_timestamp_seconds",
            "Unix time of the last run"
        ))?;
        let collect_errors_total = CounterVec::new(
            opts!(
                "procreport_collect_errors_total",
                "Fatal collection failures by kind"
            ),
            &["kind"],
        )?;

        register(&registry, &records)?;
        register(&registry, &unique_users)?;
        register(&registry, &skipped_lines_total)?;
        register(&registry, &cpu_time_fallbacks_total)?;
        register(&registry, &field_fallbacks_total)?;
        register(&registry, &duplicate_pids_total)?;
        register(&registry, &collect_duration_seconds)?;
        register(&registry, &last_run_timestamp_seconds)?;
        register(&registry, &collect_errors_total)?;

        Ok(Self {
            registry,
            records,
            unique_users,
            skipped_lines_total,
            cpu_time_fallbacks_total,
            field_fallbacks_total,
            duplicate_pids_total,
            collect_duration_seconds,
            last_run_timestamp_seconds,
            collect_errors_total,
        })
    }

    pub fn record_run(&self, report: &Report, stats: &CollectStats) {
        self.records.set(report.process_count() as f64);
        self.unique_users.set(report.unique_user_count() as f64);
        self.skipped_lines_total.inc_by(stats.skipped_lines as f64);
        self.cpu_time_fallbacks_total
            .inc_by(stats.cpu_time_fallbacks as f64);
        for (field, count) in &stats.field_fallbacks {
            self.field_fallbacks_total
                .with_label_values(&[*field])
                .inc_by(*count as f64);
        }
        self.duplicate_pids_total.inc_by(stats.duplicate_pids as f64);
        self.collect_duration_seconds
            .set(stats.elapsed.as_secs_f64());
        self.last_run_timestamp_seconds.set(now_unix() as f64);
    }

    pub fn inc_collect_error(&self, kind: &str) {
        self.collect_errors_total.with_label_values(&[kind]).inc();
        self.last_run_timestamp_seconds.set(now_unix() as f64);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Writes via a sibling temp file so textfile collectors never read a partial file.
    pub fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        let bytes = self
            .encode_metrics()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("prom.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::{self, FakeRunner};
    use crate::collectors::ProcessSource;
    use crate::config::Config;
    use crate::host::fake::FixedHost;
    use crate::report::ReportAssembler;
    use std::sync::Arc;

    const LISTING: &str = "4|System||1.5|151552|0|5231|274||
1234|chrome|john.doe|12.5|oops|10485760|812|34|2026-10-14 09:15:44|C:\\Apps\\chrome.exe
1300|svchost|NT AUTHORITY\\SYSTEM|3.75|20971520|4194304|410|12||
garbage
";

    async fn collected() -> (Report, CollectStats) {
        let source = ProcessSource::for_os(
            "windows",
            Arc::new(FakeRunner::new(|_| fake::ok(LISTING))),
            &Config::default(),
        )
        .expect("windows source");
        let host = FixedHost {
            host_name: Some("build-01".to_string()),
            total_memory_bytes: Some(16 * 1024 * 1024 * 1024),
            user: Some("ops".to_string()),
        };
        ReportAssembler::new(source, host)
            .run_with_stats()
            .await
            .expect("report builds")
    }

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf-8")
    }

    #[test]
    fn error_counter_is_labelled_by_kind() {
        let metrics = Metrics::new().expect("metrics register");
        metrics.inc_collect_error("permission_denied");
        let text = encoded(&metrics);
        assert!(text.contains("procreport_collect_errors_total{kind=\"permission_denied\"} 1"));
    }

    #[tokio::test]
    async fn run_updates_gauges_and_counters() {
        let (report, mut stats) = collected().await;
        stats.cpu_time_fallbacks = 2;
        let metrics = Metrics::new().expect("metrics register");
        metrics.record_run(&report, &stats);

        let text = encoded(&metrics);
        assert!(text.contains("procreport_records 3"));
        assert!(text.contains("procreport_unique_users 2"));
        assert!(text.contains("procreport_skipped_lines_total 1"));
        assert!(text.contains("procreport_cpu_time_fallbacks_total 2"));
        assert!(text.contains("procreport_field_fallbacks_total{field=\"workingSetMB\"} 1"));
        assert!(text.contains("procreport_duplicate_pids_total 0"));
        assert!(metrics.last_run_timestamp_seconds.get() > 0.0);
        assert_eq!(
            metrics.collect_duration_seconds.get(),
            stats.elapsed.as_secs_f64()
        );
    }

    #[tokio::test]
    async fn textfile_is_written_atomically() {
        let (report, stats) = collected().await;
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("textfile").join("procreport.prom");
        let metrics = Metrics::new().expect("metrics register");
        metrics.record_run(&report, &stats);
        metrics.write_textfile(&path).expect("textfile written");

        let text = fs::read_to_string(&path).expect("textfile readable");
        assert!(text.contains("procreport_records 3"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
