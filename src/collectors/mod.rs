pub mod posix;
pub mod windows;

use crate::config::Config;
use posix::{PosixSource, PsFlavor};
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use windows::WindowsSource;

/// Units the source reports memory sizes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    Bytes,
    Kilobytes,
}

impl MemoryUnit {
    pub fn to_bytes(self, amount: f64) -> f64 {
        match self {
            MemoryUnit::Bytes => amount,
            MemoryUnit::Kilobytes => amount * 1024.0,
        }
    }
}

/// Accumulated CPU time exactly as the platform reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCpuTime {
    /// Decimal seconds, e.g. `12.5`.
    Seconds(String),
    /// Clock notation from `ps`, e.g. `1:02.03` or `01:02:03`.
    Clock(String),
    NotApplicable,
}

/// One platform-native process entry. Numeric fields stay textual so that
/// a malformed value only degrades its own field during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcess {
    pub pid: u32,
    pub name: String,
    pub owner: Option<String>,
    pub cpu_time: RawCpuTime,
    /// `None` when the source has no single-sample reading.
    pub cpu_percent: Option<String>,
    pub memory_unit: MemoryUnit,
    pub working_set: Option<String>,
    pub paged_memory: Option<String>,
    pub handle_count: Option<String>,
    pub thread_count: Option<String>,
    pub start_time: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    pub entries: Vec<RawProcess>,
    pub skipped_lines: u64,
    pub cpu_time_fallbacks: u64,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("permission denied while enumerating processes: {0}")]
    PermissionDenied(String),
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("process listing via {program} failed: {reason}")]
    Command { program: String, reason: String },
    #[error("process listing returned no processes")]
    Empty,
}

impl CollectError {
    pub fn kind(&self) -> &'static str {
        match self {
            CollectError::PermissionDenied(_) => "permission_denied",
            CollectError::UnsupportedPlatform(_) => "unsupported_platform",
            CollectError::Command { .. } => "command",
            CollectError::Empty => "empty",
        }
    }
}

/// Recoverable parse failures. They are logged and absorbed into sentinels.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("line {line_no} does not match the expected layout: {line:?}")]
    Line { line_no: usize, line: String },
    #[error("field {field} has malformed value {value:?}")]
    Field { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between collectors and the external programs they call.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, invocation: &Invocation)
        -> impl Future<Output = io::Result<CommandOutput>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: decode_cmd_stdout(&output.stdout),
            stderr: decode_cmd_stdout(&output.stderr),
        })
    }
}

/// Platform collectors, selected once at startup.
pub enum ProcessSource<R: CommandRunner> {
    Windows(WindowsSource<R>),
    Posix(PosixSource<R>),
}

impl<R: CommandRunner> ProcessSource<R> {
    pub fn detect(runner: Arc<R>, cfg: &Config) -> Result<Self, CollectError> {
        Self::for_os(std::env::consts::OS, runner, cfg)
    }

    pub fn for_os(os: &str, runner: Arc<R>, cfg: &Config) -> Result<Self, CollectError> {
        match os {
            "windows" => Ok(ProcessSource::Windows(WindowsSource::new(
                runner,
                cfg.windows.clone(),
            ))),
            "linux" => Ok(ProcessSource::Posix(PosixSource::new(
                runner,
                cfg.posix.clone(),
                PsFlavor::Procps,
            ))),
            "macos" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" | "solaris" | "illumos" => {
                Ok(ProcessSource::Posix(PosixSource::new(
                    runner,
                    cfg.posix.clone(),
                    PsFlavor::Bsd,
                )))
            }
            other => Err(CollectError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessSource::Windows(_) => "windows",
            ProcessSource::Posix(_) => "posix",
        }
    }

    pub async fn list_processes(&self) -> Result<RawBatch, CollectError> {
        match self {
            ProcessSource::Windows(source) => source.list_processes().await,
            ProcessSource::Posix(source) => source.list_processes().await,
        }
    }
}

/// Maps a failure to spawn the listing program itself.
pub(crate) fn spawn_error(program: &str, err: io::Error) -> CollectError {
    match err.kind() {
        io::ErrorKind::NotFound => {
            CollectError::UnsupportedPlatform(format!("{program} is not available: {err}"))
        }
        io::ErrorKind::PermissionDenied => {
            CollectError::PermissionDenied(format!("cannot execute {program}: {err}"))
        }
        _ => CollectError::Command {
            program: program.to_string(),
            reason: err.to_string(),
        },
    }
}

pub(crate) fn looks_like_permission_denied(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("access is denied")
        || lower.contains("access denied")
        || lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("unauthorizedaccess")
}

fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{CommandOutput, CommandRunner, Invocation};
    use std::io;
    use std::sync::Mutex;

    type Responder = dyn Fn(&Invocation) -> io::Result<CommandOutput> + Send + Sync;

    /// Answers invocations from a closure and records what was asked.
    pub struct FakeRunner {
        responder: Box<Responder>,
        pub calls: Mutex<Vec<Invocation>>,
    }

    impl FakeRunner {
        pub fn new(
            responder: impl Fn(&Invocation) -> io::Result<CommandOutput> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().map(|c| c.len()).unwrap_or(0)
        }
    }

    impl CommandRunner for FakeRunner {
        async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation.clone());
            }
            (self.responder)(invocation)
        }
    }

    pub fn ok(stdout: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            success: true,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn failed(code: i32, stderr: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            success: false,
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}
