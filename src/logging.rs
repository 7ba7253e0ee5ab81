//! Log setup for every taskfarm process.
//!
//! The operator CLI, the Streamer, worker pools and workers all log through
//! `tracing` to stderr; a worker's stdout is reserved for the stdio task
//! protocol.
//!
//! # Environment Variables
//!
//! - `TASKFARM_LOG` - Log filter (overrides RUST_LOG)
//! - `TASKFARM_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `TASKFARM_LOG_FORMAT` - Output format: pretty, compact, json
//! - `TASKFARM_LOG_FILE` - Path to log file (in addition to stderr)
//! - `TASKFARM_LOG_ROTATION` - Rotation of the log file: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Pools and workers inherit `TASKFARM_LOG_FILE` from whoever started them.
//! Each of those processes writes `<stem>.<pid>.<ext>` next to the
//! configured path instead of sharing one rolling file.
//!
//! ```no_run
//! use taskfarm::logging::{LogConfig, ProcessRole, init};
//!
//! init(LogConfig::for_role(ProcessRole::Streamer).with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Which kind of taskfarm process is logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessRole {
    /// The operator CLI and Starmap submitters.
    #[default]
    Operator,
    Streamer,
    Pool,
    Worker,
}

impl ProcessRole {
    /// Pools and workers come in numbers; they get per-pid log files.
    pub fn is_replicated(self) -> bool {
        matches!(self, Self::Pool | Self::Worker)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub role: ProcessRole,
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file; stderr is always written
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    pub span_events: bool,
    /// Filter directives, overriding `level` when set
    pub filter: Option<String>,
    pub show_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_role(ProcessRole::Operator)
    }
}

impl LogConfig {
    /// Defaults for one kind of process.
    ///
    /// Pools and workers log compact lines with thread ids, since many of
    /// them share a terminal. The Streamer runs in the foreground and shows
    /// its lifecycle at INFO.
    pub fn for_role(role: ProcessRole) -> Self {
        let replicated = role.is_replicated();
        Self {
            role,
            level: Level::INFO,
            format: if replicated {
                LogFormat::Compact
            } else {
                LogFormat::Pretty
            },
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_thread_ids: replicated,
        }
    }

    /// Set the level, never quieter than INFO for the Streamer.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = match self.role {
            ProcessRole::Streamer => level.max(Level::INFO),
            _ => level,
        };
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line wins over `TASKFARM_LOG`,
    /// `RUST_LOG` and `TASKFARM_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("TASKFARM_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Some(level) = std::env::var("TASKFARM_LOG_LEVEL")
                .ok()
                .and_then(|s| parse_level(&s))
        {
            self = self.with_level(level);
        }

        if let Some(format) = env_parse::<LogFormat>("TASKFARM_LOG_FORMAT") {
            self.format = format;
        }
        if let Some(rotation) = env_parse::<LogRotation>("TASKFARM_LOG_ROTATION") {
            self.rotation = rotation;
        }
        if self.file_path.is_none()
            && let Ok(path) = std::env::var("TASKFARM_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Directory and file name the rolling appender writes to.
    pub fn log_file(&self) -> Option<(PathBuf, String)> {
        let path = self.file_path.as_ref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("taskfarm");
        let ext = path.extension().and_then(|s| s.to_str());

        let name = match (self.role.is_replicated(), ext) {
            (true, Some(ext)) => format!("{}.{}.{}", stem, std::process::id(), ext),
            (true, None) => format!("{}.{}", stem, std::process::id()),
            (false, Some(ext)) => format!("{}.{}", stem, ext),
            (false, None) => stem.to_string(),
        };
        Some((dir, name))
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok()?.parse().ok()
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync + 'static>;

fn format_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_span_events(span_events)
        .with_ansi(ansi)
        .with_writer(writer);
    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base
            .compact()
            .with_thread_ids(config.show_thread_ids)
            .boxed(),
        LogFormat::Pretty => base.with_thread_ids(config.show_thread_ids).boxed(),
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![format_layer(&config, std::io::stderr, true)];

    if let Some((dir, name)) = config.log_file() {
        let appender = RollingFileAppender::new(config.rotation.into(), dir, name);
        layers.push(format_layer(&config, appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(layers)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_role_presets() {
        let worker = LogConfig::for_role(ProcessRole::Worker);
        assert_eq!(worker.format, LogFormat::Compact);
        assert!(worker.show_thread_ids);

        let operator = LogConfig::default();
        assert_eq!(operator.role, ProcessRole::Operator);
        assert_eq!(operator.format, LogFormat::Pretty);
        assert_eq!(operator.with_level(Level::WARN).level, Level::WARN);
    }

    #[test]
    fn test_streamer_stays_at_info() {
        let streamer = LogConfig::for_role(ProcessRole::Streamer).with_level(Level::WARN);
        assert_eq!(streamer.level, Level::INFO);
        let streamer = streamer.with_level(Level::DEBUG);
        assert_eq!(streamer.level, Level::DEBUG);
    }

    #[test]
    fn test_log_file_per_process() {
        let path = PathBuf::from("/var/log/farm/taskfarm.log");
        let operator = LogConfig::default().with_file(path.clone());
        assert_eq!(
            operator.log_file(),
            Some((PathBuf::from("/var/log/farm"), "taskfarm.log".to_string()))
        );

        let worker = LogConfig::for_role(ProcessRole::Worker).with_file(path);
        let (dir, name) = worker.log_file().unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/farm"));
        assert_eq!(name, format!("taskfarm.{}.log", std::process::id()));

        let bare = LogConfig::for_role(ProcessRole::Pool).with_file(PathBuf::from("pool"));
        let (dir, name) = bare.log_file().unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, format!("pool.{}", std::process::id()));

        assert!(LogConfig::default().log_file().is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides_respect_cli_filter() {
        // SAFETY: serialized with the other environment-mutating tests
        unsafe {
            std::env::set_var("TASKFARM_LOG", "taskfarm=trace");
            std::env::set_var("TASKFARM_LOG_FORMAT", "json");
            std::env::set_var("TASKFARM_LOG_ROTATION", "hourly");
        }
        let from_env = LogConfig::default().with_env_overrides();
        let from_cli = LogConfig::default()
            .with_filter("warn".to_string())
            .with_env_overrides();
        unsafe {
            std::env::remove_var("TASKFARM_LOG");
            std::env::remove_var("TASKFARM_LOG_FORMAT");
            std::env::remove_var("TASKFARM_LOG_ROTATION");
        }

        assert_eq!(from_env.filter.as_deref(), Some("taskfarm=trace"));
        assert_eq!(from_env.format, LogFormat::Json);
        assert_eq!(from_env.rotation, LogRotation::Hourly);
        assert_eq!(from_cli.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LogConfig::default());
        init(LogConfig::default().with_format(LogFormat::Json));
    }
}
