use crate::reaper::ReaperTimings;
use crate::schedule::{ScheduleError, ShutdownSchedule, DEFAULT_EXIT_WAIT};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

/// Environment variable naming the log destination (`-` for stderr).
pub const ENV_LOG_FILE: &str = "PYREX_CLEANUP_LOG_FILE";
/// Environment variable holding the minimum log severity.
pub const ENV_LOG_LEVEL: &str = "PYREX_CLEANUP_LOG_LEVEL";
/// Environment variable holding the shutdown schedule.
pub const ENV_EXIT_WAIT: &str = "PYREX_CLEANUP_EXIT_WAIT";

/// Log file value meaning "standard error".
const STDERR_SENTINEL: &str = "-";

/// Top-level configuration, optionally loaded from a TOML file.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    pub log: LogConfig,
    pub shutdown: ShutdownConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub file: String,
    pub level: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub exit_wait: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub fast_tick_ms: u64,
    pub slow_tick_ms: u64,
    pub throttle_after_secs: f64,
    pub signal_enable_after_secs: f64,
}

// --- Default implementations ---

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: STDERR_SENTINEL.to_string(),
            level: "WARNING".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            exit_wait: DEFAULT_EXIT_WAIT.to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fast_tick_ms: 10,
            slow_tick_ms: 500,
            throttle_after_secs: 2.0,
            signal_enable_after_secs: 10.0,
        }
    }
}

/// Where diagnostics go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    File(PathBuf),
}

impl LogDestination {
    pub fn parse(value: &str) -> Self {
        if value == STDERR_SENTINEL {
            LogDestination::Stderr
        } else {
            LogDestination::File(PathBuf::from(value))
        }
    }
}

impl fmt::Display for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDestination::Stderr => write!(f, "stderr"),
            LogDestination::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Minimum severity of emitted diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            // No separate critical level; treat it as error.
            "error" | "critical" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Errors that can occur while resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The log level is not one of the recognised names.
    InvalidLogLevel { value: String },
    /// The shutdown schedule string is malformed.
    InvalidExitWait { source: ScheduleError },
    /// A timing value is negative or not finite.
    InvalidTiming { field: &'static str, value: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
            ConfigError::InvalidLogLevel { value } => {
                write!(f, "Invalid value for {ENV_LOG_LEVEL}: {value}")
            }
            ConfigError::InvalidExitWait { source } => {
                write!(f, "Invalid value for {ENV_EXIT_WAIT}: {} ({source})", source.value())
            }
            ConfigError::InvalidTiming { field, value } => {
                write!(f, "invalid timing.{field}: {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidExitWait { source } => Some(source),
            ConfigError::InvalidLogLevel { .. } | ConfigError::InvalidTiming { .. } => None,
        }
    }
}

/// Load config from a TOML file.
pub fn load_config(path: &Path) -> Result<CleanupConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl CleanupConfig {
    /// Override file values with environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(file) = lookup(ENV_LOG_FILE) {
            self.log.file = file;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
        if let Some(exit_wait) = lookup(ENV_EXIT_WAIT) {
            self.shutdown.exit_wait = exit_wait;
        }
    }

    pub fn log_destination(&self) -> LogDestination {
        LogDestination::parse(&self.log.file)
    }

    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.log.level.parse()
    }

    pub fn schedule(&self) -> Result<ShutdownSchedule, ConfigError> {
        ShutdownSchedule::parse(&self.shutdown.exit_wait)
            .map_err(|e| ConfigError::InvalidExitWait { source: e })
    }

    pub fn timings(&self) -> Result<ReaperTimings, ConfigError> {
        let t = &self.timing;
        Ok(ReaperTimings {
            fast_tick: tick("fast_tick_ms", t.fast_tick_ms)?,
            slow_tick: tick("slow_tick_ms", t.slow_tick_ms)?,
            throttle_after: secs("throttle_after_secs", t.throttle_after_secs)?,
            signal_enable_after: secs("signal_enable_after_secs", t.signal_enable_after_secs)?,
        })
    }
}

/// Poll intervals must be non-zero or the wait loop spins.
fn tick(field: &'static str, millis: u64) -> Result<Duration, ConfigError> {
    if millis == 0 {
        return Err(ConfigError::InvalidTiming { field, value: 0.0 });
    }
    Ok(Duration::from_millis(millis))
}

fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value < 0.0 {
        return Err(ConfigError::InvalidTiming { field, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidTiming { field, value })
}
