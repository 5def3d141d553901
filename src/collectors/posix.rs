use crate::collectors::{
    looks_like_permission_denied, spawn_error, CollectError, CommandOutput, CommandRunner,
    Invocation, MemoryUnit, ParseError, RawBatch, RawCpuTime, RawProcess,
};
use crate::config::PosixConfig;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Which `ps` dialect the host speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsFlavor {
    /// Linux procps: `user` is cut to 8 characters unless widened, `comm`
    /// is the kernel task name and executable paths live under procfs.
    Procps,
    /// BSD-derived `ps` (macOS and the BSDs): full user names, `comm` is
    /// the executable path.
    Bsd,
}

impl PsFlavor {
    fn listing_columns(self) -> [&'static str; 6] {
        let user = match self {
            PsFlavor::Procps => "user:64=",
            PsFlavor::Bsd => "user=",
        };
        ["pid=", user, "%cpu=", "rss=", "lstart=", "comm="]
    }
}

pub struct PosixSource<R: CommandRunner> {
    runner: Arc<R>,
    cfg: PosixConfig,
    flavor: PsFlavor,
}

impl<R: CommandRunner> PosixSource<R> {
    pub fn new(runner: Arc<R>, cfg: PosixConfig, flavor: PsFlavor) -> Self {
        Self {
            runner,
            cfg,
            flavor,
        }
    }

    pub fn flavor(&self) -> PsFlavor {
        self.flavor
    }

    fn listing_invocation(&self) -> Invocation {
        let mut args = vec!["-A".to_string()];
        for column in self.flavor.listing_columns() {
            args.push("-o".to_string());
            args.push(column.to_string());
        }
        Invocation::new(&self.cfg.ps_program, args).env("LC_ALL", "C")
    }

    fn cpu_time_invocation(&self, pid: u32) -> Invocation {
        Invocation::new(
            &self.cfg.ps_program,
            ["-o".to_string(), "time=".to_string(), "-p".to_string(), pid.to_string()],
        )
        .env("LC_ALL", "C")
    }

    /// `<proc_root>/<pid>/exe`, only where procfs exposes it.
    fn exe_link(&self, entry: &RawProcess) -> Option<PathBuf> {
        (self.flavor == PsFlavor::Procps && entry.path.is_none())
            .then(|| Path::new(&self.cfg.proc_root).join(entry.pid.to_string()).join("exe"))
    }

    pub async fn list_processes(&self) -> Result<RawBatch, CollectError> {
        let invocation = self.listing_invocation();
        debug!(flavor = ?self.flavor(), program = %invocation.program, "listing processes");
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|err| spawn_error(&invocation.program, err))?;

        if !output.success {
            if looks_like_permission_denied(&output.stderr) {
                return Err(CollectError::PermissionDenied(output.stderr.trim().to_string()));
            }
            // ps exits with 1 when nothing matched the selection.
            let nothing_listed = output.exit_code == Some(1)
                && output.stdout.trim().is_empty()
                && output.stderr.trim().is_empty();
            if !nothing_listed {
                return Err(CollectError::Command {
                    program: invocation.program,
                    reason: failure_reason(&output),
                });
            }
        }

        let (mut entries, skipped_lines) = parse_listing(&output.stdout);
        let cpu_time_fallbacks = self.attach_details(&mut entries).await;

        Ok(RawBatch {
            entries,
            skipped_lines,
            cpu_time_fallbacks,
        })
    }

    /// One follow-up `ps -o time=` per PID, plus the procfs executable link
    /// on Linux. A process may exit between the listing and its lookup; that
    /// record keeps `NotApplicable` CPU time and no path.
    async fn attach_details(&self, entries: &mut [RawProcess]) -> u64 {
        let semaphore = Arc::new(Semaphore::new(self.cfg.cpu_time_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, entry) in entries.iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&semaphore);
            let invocation = self.cpu_time_invocation(entry.pid);
            let exe_link = self.exe_link(entry);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = runner.run(&invocation).await;
                let exe = match exe_link {
                    Some(link) => resolve_exe(&link).await,
                    None => None,
                };
                (idx, cpu_time_from_output(result), exe)
            });
        }

        let mut fallbacks = 0_u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, clock, exe)) => {
                    let entry = &mut entries[idx];
                    if exe.is_some() {
                        entry.path = exe;
                    }
                    match clock {
                        Some(clock) => entry.cpu_time = RawCpuTime::Clock(clock),
                        None => {
                            fallbacks += 1;
                            debug!(pid = entry.pid, "cpu time lookup failed, process likely exited");
                        }
                    }
                }
                Err(err) => {
                    fallbacks += 1;
                    warn!(error = %err, "cpu time lookup task failed");
                }
            }
        }

        fallbacks
    }
}

/// Kernel threads and other users' processes have no readable link.
async fn resolve_exe(link: &Path) -> Option<String> {
    let target = tokio::fs::read_link(link).await.ok()?;
    let lossy = target.to_string_lossy();
    let path = lossy.strip_suffix(" (deleted)").unwrap_or(&*lossy);
    path.starts_with('/').then(|| path.to_string())
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<pid>\d+)\s+(?P<user>\S+)\s+(?P<cpu>\S+)\s+(?P<rss>\S+)\s+(?P<start>\w{3}\s+\w{3}\s+\d{1,2}\s+\d{1,2}:\d{2}:\d{2}\s+\d{4})\s+(?P<command>\S.*)$",
        )
        .expect("ps line pattern must compile")
    })
}

/// Parses `ps` listing output. Lines that do not fit the column layout are
/// logged and skipped; the count of skipped lines is returned.
pub fn parse_listing(stdout: &str) -> (Vec<RawProcess>, u64) {
    let mut entries = Vec::new();
    let mut skipped = 0_u64;

    for (idx, line) in stdout.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(idx + 1, line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                skipped += 1;
                warn!(error = %err, "skipping ps line");
            }
        }
    }

    (entries, skipped)
}

fn parse_line(line_no: usize, line: &str) -> Result<RawProcess, ParseError> {
    let line_error = || ParseError::Line {
        line_no,
        line: line.to_string(),
    };
    let caps = line_pattern().captures(line).ok_or_else(line_error)?;
    let pid: u32 = caps["pid"].parse().map_err(|_| line_error())?;

    // Only an absolute command is a path; procps task names may contain '/'.
    let command = caps["command"].trim();
    let (name, path) = if command.starts_with('/') {
        let base = command
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(command);
        (base.to_string(), Some(command.to_string()))
    } else {
        (command.to_string(), None)
    };
    let start_time = caps["start"].split_whitespace().collect::<Vec<_>>().join(" ");

    Ok(RawProcess {
        pid,
        name,
        owner: Some(caps["user"].to_string()),
        cpu_time: RawCpuTime::NotApplicable,
        cpu_percent: Some(caps["cpu"].to_string()),
        memory_unit: MemoryUnit::Kilobytes,
        working_set: Some(caps["rss"].to_string()),
        paged_memory: None,
        handle_count: None,
        thread_count: None,
        start_time: Some(start_time),
        path,
    })
}

fn cpu_time_from_output(result: io::Result<CommandOutput>) -> Option<String> {
    let output = result.ok()?;
    if !output.success {
        return None;
    }
    output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn failure_reason(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    match (output.exit_code, stderr.is_empty()) {
        (Some(code), true) => format!("exit status {code}"),
        (Some(code), false) => format!("exit status {code}: {stderr}"),
        (None, true) => "terminated by signal".to_string(),
        (None, false) => stderr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::{self, FakeRunner};

    const LISTING: &str = "    1 root              0.0  11892 Wed Oct 14 09:12:01 2026 /sbin/launchd
  412 john.doe          1.5 204800 Wed Oct 14 09:15:44 2026 /Applications/Google Chrome.app/Contents/MacOS/Google Chrome
  977 john.doe          0.0   3120 Thu Oct  1 08:00:00 2026 bash
  978 john.doe          0.0   3120 Thu Oct  1 08:00:00 2026
";

    fn source(runner: FakeRunner) -> (PosixSource<FakeRunner>, Arc<FakeRunner>) {
        source_with(runner, PsFlavor::Bsd, Path::new("/nonexistent-proc"))
    }

    fn source_with(
        runner: FakeRunner,
        flavor: PsFlavor,
        proc_root: &Path,
    ) -> (PosixSource<FakeRunner>, Arc<FakeRunner>) {
        let runner = Arc::new(runner);
        let cfg = PosixConfig {
            ps_program: "ps".to_string(),
            cpu_time_concurrency: 2,
            proc_root: proc_root.display().to_string(),
        };
        (PosixSource::new(Arc::clone(&runner), cfg, flavor), runner)
    }

    fn is_listing(invocation: &Invocation) -> bool {
        invocation.args.first().map(String::as_str) == Some("-A")
    }

    #[test]
    fn parses_well_formed_lines_and_skips_missing_command() {
        let (entries, skipped) = parse_listing(LISTING);
        assert_eq!(entries.len(), 3);
        assert_eq!(skipped, 1);

        let chrome = &entries[1];
        assert_eq!(chrome.pid, 412);
        assert_eq!(chrome.name, "Google Chrome");
        assert_eq!(chrome.owner.as_deref(), Some("john.doe"));
        assert_eq!(chrome.cpu_percent.as_deref(), Some("1.5"));
        assert_eq!(chrome.working_set.as_deref(), Some("204800"));
        assert_eq!(chrome.memory_unit, MemoryUnit::Kilobytes);
        assert_eq!(chrome.start_time.as_deref(), Some("Wed Oct 14 09:15:44 2026"));
        assert_eq!(
            chrome.path.as_deref(),
            Some("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
        );

        let bash = &entries[2];
        assert_eq!(bash.name, "bash");
        assert!(bash.path.is_none(), "relative command is not a path");
        assert_eq!(bash.start_time.as_deref(), Some("Thu Oct 1 08:00:00 2026"));
    }

    #[test]
    fn procps_task_names_and_long_owners_are_kept_verbatim() {
        let listing = "    4 root               0.0     0 Wed Oct 14 09:12:01 2026 kworker/R-rcu_gp
  701 messagebus         0.0  4200 Wed Oct 14 09:12:03 2026 dbus-daemon
  702 systemd-network    0.0  6100 Wed Oct 14 09:12:03 2026 systemd-networkd
";
        let (entries, skipped) = parse_listing(listing);
        assert_eq!(skipped, 0);
        assert_eq!(entries[0].name, "kworker/R-rcu_gp");
        assert!(entries[0].path.is_none());
        assert_eq!(entries[1].owner.as_deref(), Some("messagebus"));
        assert_eq!(entries[2].owner.as_deref(), Some("systemd-network"));
        assert_eq!(entries[2].name, "systemd-networkd");
    }

    #[test]
    fn user_column_is_widened_only_for_procps() {
        let procps = source_with(
            FakeRunner::new(|_| fake::ok("")),
            PsFlavor::Procps,
            Path::new("/proc"),
        )
        .0
        .listing_invocation();
        assert!(procps.args.iter().any(|a| a == "user:64="));
        assert!(!procps.args.iter().any(|a| a == "user="));

        let bsd = source(FakeRunner::new(|_| fake::ok(""))).0.listing_invocation();
        assert!(bsd.args.iter().any(|a| a == "user="));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn procps_path_comes_from_the_exe_link() {
        let proc_root = tempfile::tempdir().expect("temp proc root");
        let pid_dir = proc_root.path().join("701");
        std::fs::create_dir(&pid_dir).expect("pid dir");
        std::os::unix::fs::symlink("/usr/bin/dbus-daemon (deleted)", pid_dir.join("exe"))
            .expect("exe link");

        let listing = "    4 root        0.0     0 Wed Oct 14 09:12:01 2026 kworker/R-rcu_gp
  701 messagebus  0.0  4200 Wed Oct 14 09:12:03 2026 dbus-daemon
";
        let (source, _) = source_with(
            FakeRunner::new(move |inv| {
                if is_listing(inv) {
                    fake::ok(listing)
                } else {
                    fake::ok("0:00.10\n")
                }
            }),
            PsFlavor::Procps,
            proc_root.path(),
        );

        let batch = source.list_processes().await.expect("listing succeeds");
        assert_eq!(batch.entries[0].name, "kworker/R-rcu_gp");
        assert!(batch.entries[0].path.is_none(), "kernel threads have no executable");
        assert_eq!(batch.entries[1].name, "dbus-daemon");
        assert_eq!(batch.entries[1].path.as_deref(), Some("/usr/bin/dbus-daemon"));
        assert_eq!(batch.cpu_time_fallbacks, 0);
    }

    #[test]
    fn malformed_numeric_column_still_yields_an_entry() {
        let (entries, skipped) =
            parse_listing("  55 daemon  n/a  12x Fri Oct  2 10:00:00 2026 /usr/sbin/cron\n");
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cpu_percent.as_deref(), Some("n/a"));
        assert_eq!(entries[0].working_set.as_deref(), Some("12x"));
    }

    #[test]
    fn oversized_pid_is_a_line_error() {
        let (entries, skipped) =
            parse_listing("99999999999 root 0.0 1 Wed Oct 14 09:12:01 2026 /sbin/init\n");
        assert!(entries.is_empty());
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn attaches_cpu_time_and_tolerates_exited_processes() {
        let (source, runner) = source(FakeRunner::new(|inv| {
            if is_listing(inv) {
                return fake::ok(LISTING);
            }
            match inv.args.last().map(String::as_str) {
                Some("1") => fake::ok("   1:02.50\n"),
                Some("412") => fake::ok("0:07.25\n"),
                // 977 exited between the listing and the follow-up query.
                _ => fake::failed(1, ""),
            }
        }));

        let batch = source.list_processes().await.expect("listing succeeds");
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(batch.skipped_lines, 1);
        assert_eq!(batch.cpu_time_fallbacks, 1);
        assert_eq!(batch.entries[0].cpu_time, RawCpuTime::Clock("1:02.50".to_string()));
        assert_eq!(batch.entries[1].cpu_time, RawCpuTime::Clock("0:07.25".to_string()));
        assert_eq!(batch.entries[2].cpu_time, RawCpuTime::NotApplicable);
        assert_eq!(runner.call_count(), 4, "one listing plus one lookup per entry");
    }

    #[tokio::test]
    async fn listing_uses_c_locale_and_fixed_columns() {
        let (source, runner) = source(FakeRunner::new(|_| fake::ok("")));
        source.list_processes().await.expect("empty listing is not an error");
        let calls = runner.calls.lock().expect("calls lock");
        let listing = &calls[0];
        assert_eq!(listing.program, "ps");
        assert!(listing.args.iter().any(|a| a == "lstart="));
        assert!(listing.env.contains(&("LC_ALL".to_string(), "C".to_string())));
    }

    #[tokio::test]
    async fn permission_refusal_is_fatal() {
        let (source, _) = source(FakeRunner::new(|_| {
            fake::failed(1, "ps: Operation not permitted")
        }));
        let err = source.list_processes().await.expect_err("refused listing fails");
        assert!(matches!(err, CollectError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn missing_ps_is_unsupported() {
        let (source, _) = source(FakeRunner::new(|_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "ps not found"))
        }));
        let err = source.list_processes().await.expect_err("missing ps fails");
        assert!(matches!(err, CollectError::UnsupportedPlatform(_)));
    }

    #[tokio::test]
    async fn other_failures_surface_as_command_errors() {
        let (source, _) = source(FakeRunner::new(|_| fake::failed(2, "ps: illegal option")));
        let err = source.list_processes().await.expect_err("bad invocation fails");
        assert!(matches!(err, CollectError::Command { ref reason, .. } if reason.contains("illegal option")));
    }
}
