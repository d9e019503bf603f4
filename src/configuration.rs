use futures_ticker::Ticker;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Config {
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub reload: ReloadConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// HTTP liveness endpoint. Disabled when absent.
    pub health_check: Option<HealthCheckConfig>,

    /// Paths used by the standalone harness binary. The library API does
    /// not read this section.
    pub harness: Option<HarnessConfig>,

    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Resolves a possibly-relative configured path against the directory
    /// that contained the configuration file.
    pub fn canonical_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SupervisorConfig {
    /// Name of the supervised service. Determines logging fields.
    pub name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReloadConfig {
    /// Poll interval of the fork loop. Default: 1s.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        ReloadConfig {
            tick: default_tick(),
        }
    }
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

impl ReloadConfig {
    /// The fixed-interval poll stream that drives fork scheduling.
    pub fn ticker(&self) -> Ticker {
        Ticker::new(self.tick)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HealthCheckConfig {
    /// Listen address, e.g. "127.0.0.1:3000".
    pub addr: SocketAddr,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HarnessConfig {
    /// Append-only data file the demo worker writes to.
    pub data_file: PathBuf,

    /// Where the storage index is saved between generations.
    pub index_file: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,

    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: default_log_format(),
            output: default_log_output(),
            level: default_log_level(),
        }
    }
}

fn default_log_format() -> LogFormat {
    LogFormat::Logfmt { print_prefix: true }
}

fn default_log_output() -> LogOutput {
    LogOutput::Stderr
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,

    /// Logfmt-style key=value lines.
    Logfmt {
        #[serde(default)]
        print_prefix: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}
