use crate::collectors::{
    looks_like_permission_denied, spawn_error, CollectError, CommandOutput, CommandRunner,
    Invocation, MemoryUnit, ParseError, RawBatch, RawCpuTime, RawProcess,
};
use crate::config::WindowsConfig;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

const FALLBACK_POWERSHELL: &str = r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe";
const FIELD_COUNT: usize = 10;

pub struct WindowsSource<R: CommandRunner> {
    runner: Arc<R>,
    cfg: WindowsConfig,
}

impl<R: CommandRunner> WindowsSource<R> {
    pub fn new(runner: Arc<R>, cfg: WindowsConfig) -> Self {
        Self { runner, cfg }
    }

    pub async fn list_processes(&self) -> Result<RawBatch, CollectError> {
        let mut output = self.run_listing(self.cfg.include_user_name).await?;

        if !output.success && self.cfg.include_user_name && needs_elevation(&output.stderr) {
            warn!("owner lookup requires elevation, listing processes without owners");
            output = self.run_listing(false).await?;
        }

        if !output.success {
            if looks_like_permission_denied(&output.stderr) {
                return Err(CollectError::PermissionDenied(output.stderr.trim().to_string()));
            }
            return Err(CollectError::Command {
                program: self.cfg.powershell_program.clone(),
                reason: output.stderr.trim().to_string(),
            });
        }

        let (entries, skipped_lines) = parse_listing(&output.stdout);
        Ok(RawBatch {
            entries,
            skipped_lines,
            cpu_time_fallbacks: 0,
        })
    }

    async fn run_listing(&self, include_user_name: bool) -> Result<CommandOutput, CollectError> {
        let script = wrap_script(&listing_script(include_user_name));
        let args = ["-NoProfile", "-NonInteractive", "-Command", script.as_str()];

        let primary = Invocation::new(&self.cfg.powershell_program, args);
        match self.runner.run(&primary).await {
            Ok(output) => Ok(output),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(program = %primary.program, "powershell not on PATH, trying system location");
                let fallback = Invocation::new(FALLBACK_POWERSHELL, args);
                self.runner
                    .run(&fallback)
                    .await
                    .map_err(|err| spawn_error(&primary.program, err))
            }
            Err(err) => Err(spawn_error(&primary.program, err)),
        }
    }
}

fn listing_script(include_user_name: bool) -> String {
    let get_process = if include_user_name {
        "Get-Process -IncludeUserName -ErrorAction Stop"
    } else {
        "Get-Process -ErrorAction Stop"
    };
    format!(
        "$ci=[Globalization.CultureInfo]::InvariantCulture; {get_process} | ForEach-Object {{ \
         $cpu=''; if ($null -ne $_.TotalProcessorTime) {{ $cpu=$_.TotalProcessorTime.TotalSeconds.ToString($ci) }}; \
         $start=''; if ($null -ne $_.StartTime) {{ $start=$_.StartTime.ToString('yyyy-MM-dd HH:mm:ss', $ci) }}; \
         $threads=''; if ($null -ne $_.Threads) {{ $threads=$_.Threads.Count }}; \
         $user=''; if ($_.PSObject.Properties['UserName']) {{ $user=$_.UserName }}; \
         \"$($_.Id)|$($_.ProcessName)|$user|$cpu|$($_.WorkingSet64)|$($_.PagedMemorySize64)|$($_.HandleCount)|$threads|$start|$($_.Path)\" }}"
    )
}

fn wrap_script(script: &str) -> String {
    format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); $OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    )
}

fn needs_elevation(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("includeusername") || lower.contains("elevated user rights")
}

/// Parses pipe-delimited `Get-Process` rows:
/// `Id|ProcessName|UserName|CpuSeconds|WorkingSet64|PagedMemorySize64|HandleCount|Threads|StartTime|Path`.
pub fn parse_listing(stdout: &str) -> (Vec<RawProcess>, u64) {
    let mut entries = Vec::new();
    let mut skipped = 0_u64;

    for (idx, line) in stdout.lines().enumerate() {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(idx + 1, line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => debug!("skipping idle pseudo-process"),
            Err(err) => {
                skipped += 1;
                warn!(error = %err, "skipping Get-Process line");
            }
        }
    }

    (entries, skipped)
}

fn parse_line(line_no: usize, line: &str) -> Result<Option<RawProcess>, ParseError> {
    let line_error = || ParseError::Line {
        line_no,
        line: line.to_string(),
    };
    let parts: Vec<&str> = line.splitn(FIELD_COUNT, '|').map(str::trim).collect();
    if parts.len() < FIELD_COUNT {
        return Err(line_error());
    }

    let pid: u32 = parts[0].parse().map_err(|_| line_error())?;
    if pid == 0 {
        return Ok(None);
    }
    let name = parts[1];
    if name.is_empty() {
        return Err(line_error());
    }

    let cpu_time = match non_empty(parts[3]) {
        Some(seconds) => RawCpuTime::Seconds(seconds),
        None => RawCpuTime::NotApplicable,
    };

    Ok(Some(RawProcess {
        pid,
        name: name.to_string(),
        owner: non_empty(parts[2]),
        cpu_time,
        cpu_percent: None,
        memory_unit: MemoryUnit::Bytes,
        working_set: non_empty(parts[4]),
        paged_memory: non_empty(parts[5]),
        handle_count: non_empty(parts[6]),
        thread_count: non_empty(parts[7]),
        start_time: non_empty(parts[8]),
        path: non_empty(parts[9]),
    }))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
