//! Structured logging setup for Folio
//!
//! Builds the global `tracing` subscriber used by Folio binaries and tests.
//!
//! # Features
//!
//! - **JSONL console output** by default, pretty output for development
//! - **File output** with daily, hourly or no rotation via `tracing-appender`
//! - **Session context**: spans created under a [`SessionContextGuard`] carry
//!   the engine session they belong to
//! - **Env filter**: `RUST_LOG` overrides the configured directives
//!
//! # Quick Start
//!
//! ```ignore
//! use folio_logging::{FolioSubscriberBuilder, LogConfig};
//!
//! // JSONL to the console
//! FolioSubscriberBuilder::new().init();
//!
//! // Keep the guard alive while logging to files
//! let _guard = FolioSubscriberBuilder::new()
//!     .with_config(LogConfig::production("/var/log/folio".into()))
//!     .init();
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{SessionContextData, SessionContextGuard};
pub use layers::{SessionContextExtension, SessionContextLayer};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file could not be opened
    #[error("Failed to open log file: {0}")]
    File(String),

    /// A global subscriber is already installed
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Builder for the global subscriber
pub struct FolioSubscriberBuilder {
    config: LogConfig,
}

impl FolioSubscriberBuilder {
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes file output when dropped; keep it alive
    /// for the life of the program.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be opened or a global
    /// subscriber is already set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let config = self.config;
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.directives()));

        let console_pretty = (config.console.enabled && config.console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(config.console.ansi)
                .with_target(true)
        });
        let console_json = (config.console.enabled && !config.console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(config.jsonl.include_spans)
                .flatten_event(config.jsonl.flatten_events)
                .with_file(config.jsonl.include_location)
                .with_line_number(config.jsonl.include_location)
        });

        let (file_layer, guard) = match &config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config)?;
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(config.jsonl.include_spans)
                    .flatten_event(config.jsonl.flatten_events)
                    .with_file(config.jsonl.include_location)
                    .with_line_number(config.jsonl.include_location)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        Registry::default()
            .with(env_filter)
            .with(SessionContextLayer::new())
            .with(console_pretty)
            .with(console_json)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

        Ok(guard)
    }

    /// Install the subscriber globally, reporting failures on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: {e}");
                None
            }
        }
    }
}

impl Default for FolioSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let rotation = match config.rotation {
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
        RotationStrategy::Never => Rotation::NEVER,
    };
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::File(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to the console; later calls are ignored
pub fn init_default() {
    let _ = FolioSubscriberBuilder::new().try_init();
}

/// Pretty, verbose console output; later calls are ignored
pub fn init_development() {
    let _ = FolioSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .try_init();
}

/// Warnings only; safe to call from every test
pub fn init_testing() {
    let _ = FolioSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_jsonl() {
        let builder = FolioSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
        assert!(!builder.config().console.pretty);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = FolioSubscriberBuilder::new()
            .with_config(LogConfig::development())
            .with_level("trace")
            .with_console(false)
            .with_file_output(FileConfig::default());
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
        assert!(builder.config().file.is_some());
    }

    #[test]
    fn test_init_testing_is_idempotent() {
        init_testing();
        init_testing();
        assert!(matches!(
            FolioSubscriberBuilder::new().try_init(),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
