use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub metrics_file: Option<String>,
    #[serde(default)]
    pub posix: PosixConfig,
    #[serde(default)]
    pub windows: WindowsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    #[default]
    Both,
    None,
}

impl ExportFormat {
    pub fn wants_csv(self) -> bool {
        matches!(self, ExportFormat::Csv | ExportFormat::Both)
    }

    pub fn wants_json(self) -> bool {
        matches!(self, ExportFormat::Json | ExportFormat::Both)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PosixConfig {
    #[serde(default = "default_ps_program")]
    pub ps_program: String,
    #[serde(default = "default_cpu_time_concurrency")]
    pub cpu_time_concurrency: usize,
    /// procfs mount used to resolve executable paths on Linux.
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowsConfig {
    #[serde(default = "default_powershell_program")]
    pub powershell_program: String,
    #[serde(default = "default_include_user_name")]
    pub include_user_name: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: ExportFormat::default(),
            top_n: default_top_n(),
            metrics_file: None,
            posix: PosixConfig::default(),
            windows: WindowsConfig::default(),
        }
    }
}

impl Default for PosixConfig {
    fn default() -> Self {
        Self {
            ps_program: default_ps_program(),
            cpu_time_concurrency: default_cpu_time_concurrency(),
            proc_root: default_proc_root(),
        }
    }
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            powershell_program: default_powershell_program(),
            include_user_name: default_include_user_name(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "output_dir must not be empty".to_string(),
            ));
        }
        if self.top_n < 1 {
            return Err(ConfigError::Validation("top_n must be >= 1".to_string()));
        }
        if let Some(path) = &self.metrics_file {
            if path.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "metrics_file must not be empty when set".to_string(),
                ));
            }
        }
        if self.posix.ps_program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "posix.ps_program must not be empty".to_string(),
            ));
        }
        if self.posix.cpu_time_concurrency < 1 {
            return Err(ConfigError::Validation(
                "posix.cpu_time_concurrency must be >= 1".to_string(),
            ));
        }
        if self.posix.proc_root.trim().is_empty() {
            return Err(ConfigError::Validation(
                "posix.proc_root must not be empty".to_string(),
            ));
        }
        if self.windows.powershell_program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "windows.powershell_program must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_output_dir() -> String {
    "./reports".to_string()
}

const fn default_top_n() -> usize {
    10
}

fn default_ps_program() -> String {
    "ps".to_string()
}

const fn default_cpu_time_concurrency() -> usize {
    8
}

fn default_proc_root() -> String {
    "/proc".to_string()
}

fn default_powershell_program() -> String {
    "powershell".to_string()
}

const fn default_include_user_name() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config =
            serde_yaml::from_str(Config::example_yaml()).expect("example must be valid YAML");
        cfg.validate().expect("example must pass validation");
        assert_eq!(cfg.format, ExportFormat::Both);
        assert_eq!(cfg.posix.ps_program, "ps");
    }

    #[test]
    fn empty_document_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("empty mapping parses");
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.top_n, 10);
        assert_eq!(cfg.posix.cpu_time_concurrency, 8);
        assert_eq!(cfg.posix.proc_root, "/proc");
        assert!(cfg.windows.include_user_name);
        assert!(cfg.metrics_file.is_none());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = Config::default();
        cfg.posix.cpu_time_concurrency = 0;
        let err = cfg.validate().expect_err("zero concurrency must fail");
        assert!(err.to_string().contains("cpu_time_concurrency"));
    }

    #[test]
    fn load_from_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"format: [not, a, format]\n")
            .expect("write temp config");
        let err = Config::load_from_file(file.path()).expect_err("bad format must fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_from_file_reads_overrides() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(
            b"output_dir: /tmp/out\nformat: json\nposix:\n  cpu_time_concurrency: 2\n",
        )
        .expect("write temp config");
        let cfg = Config::load_from_file(file.path()).expect("config loads");
        assert_eq!(cfg.output_dir, "/tmp/out");
        assert_eq!(cfg.format, ExportFormat::Json);
        assert_eq!(cfg.posix.cpu_time_concurrency, 2);
        assert_eq!(cfg.posix.ps_program, "ps");
    }
}
