//! Unified logging setup, shared by every binary and test harness in the
//! workspace.

use std::fs;
use std::sync::Once;

use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{format::FmtSpan, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

static LOGGER_INIT: Once = Once::new();

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub log_dir: String,
    pub console_output: bool,
    pub file_output: bool,
    pub json_format: bool,
    pub rotation: LogRotation,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_dir: "logs".to_string(),
            console_output: true,
            file_output: true,
            json_format: false,
            rotation: LogRotation::Daily,
        }
    }
}

/// Wraps `tracing-subscriber` registry construction behind one
/// process-wide `Once`, so the Session Supervisor, a CLI front-end and
/// test harnesses can all call `initialize()` without double-installing a
/// global subscriber.
pub struct UnifiedLogger {
    config: LoggerConfig,
}

impl UnifiedLogger {
    pub fn new(config: LoggerConfig) -> Self {
        Self { config }
    }

    pub fn initialize(&self) -> crate::error::Result<()> {
        LOGGER_INIT.call_once(|| {
            if let Err(e) = self.setup_logging() {
                eprintln!("failed to initialize logger: {e}");
            }
        });
        Ok(())
    }

    fn setup_logging(&self) -> crate::error::Result<()> {
        if self.config.file_output {
            fs::create_dir_all(&self.config.log_dir)?;
        }

        let level_str = match self.config.level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("scope={level_str}")));

        let registry = Registry::default().with(env_filter);

        if self.config.console_output {
            let console_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_timer(LocalTime::rfc_3339());

            if self.config.file_output {
                let file_appender = self.rolling_appender();
                let (file_writer, _guard) = non_blocking(file_appender);
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_timer(LocalTime::rfc_3339());

                if self.config.json_format {
                    registry.with(console_layer).with(file_layer.json()).init();
                } else {
                    registry.with(console_layer).with(file_layer).init();
                }
            } else {
                registry.with(console_layer).init();
            }
        } else if self.config.file_output {
            let file_appender = self.rolling_appender();
            let (file_writer, _guard) = non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());

            if self.config.json_format {
                registry.with(file_layer.json()).init();
            } else {
                registry.with(file_layer).init();
            }
        }

        info!("logger initialized, level={:?}", self.config.level);
        Ok(())
    }

    fn rolling_appender(&self) -> rolling::RollingFileAppender {
        match self.config.rotation {
            LogRotation::Daily => rolling::daily(&self.config.log_dir, "scope.log"),
            LogRotation::Hourly => rolling::hourly(&self.config.log_dir, "scope.log"),
            LogRotation::Never => rolling::never(&self.config.log_dir, "scope.log"),
        }
    }
}

pub fn init_global_logger(config: LoggerConfig) -> crate::error::Result<()> {
    UnifiedLogger::new(config).initialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn logger_initializes_against_a_temp_dir() {
        let temp_dir = tempdir().unwrap();
        let config = LoggerConfig {
            log_dir: temp_dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let logger = UnifiedLogger::new(config);
        assert!(logger.initialize().is_ok());
    }

    #[test]
    fn log_levels_map_onto_tracing_levels() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }
}
