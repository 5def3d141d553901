mod collectors;
mod config;
mod export;
mod host;
mod metrics;
mod normalize;
mod record;
mod report;

use clap::Parser;
use config::{Config, ExportFormat};
use metrics::Metrics;
use report::ReportAssembler;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "procreport")]
#[command(version)]
struct Cli {
    /// YAML config; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, value_enum)]
    format: Option<ExportFormat>,
    #[arg(long)]
    output_dir: Option<String>,
    #[arg(long)]
    metrics_file: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(format) = cli.format {
        cfg.format = format;
    }
    if let Some(dir) = cli.output_dir {
        cfg.output_dir = dir;
    }
    if let Some(path) = cli.metrics_file {
        cfg.metrics_file = Some(path);
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let collected = match ReportAssembler::for_current_platform(&cfg) {
        Ok(assembler) => assembler.run_with_stats().await,
        Err(err) => Err(err),
    };
    let (report, stats) = match collected {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, kind = err.kind(), "process snapshot failed");
            metrics.inc_collect_error(err.kind());
            flush_metrics(&metrics, cfg.metrics_file.as_deref());
            std::process::exit(1);
        }
    };
    metrics.record_run(&report, &stats);

    info!(
        computer = report.computer_name(),
        generated_by = report.generated_by(),
        generated_at = report.generated_at(),
        processes = report.process_count(),
        users = report.unique_user_count(),
        duplicate_pids = stats.duplicate_pids,
        memory_total_known = stats.total_memory_known,
        "process report ready"
    );
    for record in report.top_by_memory(cfg.top_n) {
        info!(
            pid = record.pid,
            name = %record.process_name,
            owner = %record.owner,
            total_mb = record.total_memory_mb,
            memory_pct = record.memory_percentage,
            "top memory consumer"
        );
    }
    for summary in report.owner_summary() {
        info!(
            owner = %summary.owner,
            processes = summary.process_count,
            total_mb = summary.total_memory_mb,
            "owner summary"
        );
    }

    let exported = export::export(&report, Path::new(&cfg.output_dir), cfg.format);
    flush_metrics(&metrics, cfg.metrics_file.as_deref());
    if let Err(err) = exported {
        error!(error = %err, "failed to export report");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn flush_metrics(metrics: &Metrics, path: Option<&str>) {
    let Some(path) = path else {
        return;
    };
    if let Err(err) = metrics.write_textfile(Path::new(path)) {
        warn!(error = %err, path, "failed to write metrics textfile");
    }
}
