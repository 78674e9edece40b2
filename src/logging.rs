//! Structured logging for the pacing engine
//!
//! The library only emits `tracing` events. Binaries pick an output format
//! and an optional rotating log file through [`LogConfig`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// `[logging]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level for `pacing` events, raised by `-v`
    pub level: LogLevel,

    /// Console format
    pub format: LogFormat,

    /// Log file path (None for stderr only)
    pub file_path: Option<PathBuf>,

    /// Rotate the log file daily
    pub rotation: bool,

    /// Report span enter/close on the console and span context in JSON
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Compact,
            file_path: None,
            rotation: true,
            include_spans: false,
        }
    }
}

/// Verbosity accepted in the `[logging]` section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const ORDER: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    /// Level after `verbosity` steps towards trace
    pub fn raised_by(self, verbosity: u8) -> Self {
        let current = Self::ORDER.iter().position(|l| *l == self).unwrap_or(1);
        Self::ORDER[(current + verbosity as usize).min(Self::ORDER.len() - 1)]
    }

    /// Filter enabling this level for the `pacing` targets only, so that
    /// dependencies stay quiet under `-vvv`
    fn filter(&self) -> EnvFilter {
        let level = LevelFilter::from_level(self.to_tracing_level());
        EnvFilter::default().add_directive(
            Directive::from_str(&format!("pacing={}", level)).unwrap_or_else(|_| level.into()),
        )
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line output with source locations
    Pretty,
    /// One JSON object per event
    Json,
    /// Single-line output
    Compact,
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level. Console output goes to stderr
/// so that `--json` results on stdout stay machine readable. The log file, if
/// any, always receives JSON.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.level.filter());

    let span_events = if config.include_spans {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let console_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(config.include_spans)
            .with_span_list(config.include_spans)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .boxed(),
    };

    let file_layer = match &config.file_path {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(file_writer(path, config.rotation)?)
                .with_current_span(config.include_spans)
                .with_span_list(config.include_spans),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        level = %config.level.to_tracing_level(),
        format = ?config.format,
        file = ?config.file_path,
        "logging initialized"
    );

    Ok(())
}

/// Daily rolling appender next to `path`, or `path` itself opened for append
fn file_writer(path: &Path, rotation: bool) -> anyhow::Result<BoxMakeWriter> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    if rotation {
        let prefix = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("pacing.log");
        Ok(BoxMakeWriter::new(tracing_appender::rolling::daily(dir, prefix)))
    } else {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BoxMakeWriter::new(Mutex::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_config_file() {
        let config: LogConfig = toml::from_str("level = \"debug\"\nformat = \"json\"\n").unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.file_path.is_none());
        assert!(toml::from_str::<LogConfig>("level = \"loud\"\n").is_err());
    }

    #[test]
    fn test_verbosity_raises_level() {
        assert_eq!(LogLevel::Warn.raised_by(0), LogLevel::Warn);
        assert_eq!(LogLevel::Warn.raised_by(2), LogLevel::Debug);
        assert_eq!(LogLevel::Info.raised_by(9), LogLevel::Trace);
        assert_eq!(LogLevel::Warn.raised_by(1).to_tracing_level(), Level::INFO);
    }

    #[test]
    fn test_filter_scoped_to_crate() {
        let filter = LogLevel::Debug.filter().to_string().to_lowercase();
        assert!(filter.contains("pacing=debug"), "{}", filter);
    }

    #[test]
    fn test_plain_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("pacing.log");
        file_writer(&path, false).unwrap();
        assert!(path.exists());
    }
}
