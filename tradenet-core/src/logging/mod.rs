//! Logging for tradenet
//!
//! Diagnostics go through `tracing`. This module installs the global
//! subscriber: an `EnvFilter` (honouring `RUST_LOG` when set) plus a `fmt`
//! layer in either human or JSON form, written to stderr.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

use crate::config::LoggingConfig;

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
    /// Extra filter directives, e.g. `tradenet_core::core_router=trace`
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of the node configuration
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        Self {
            level: settings.level,
            with_timestamp: settings.with_timestamp,
            with_target: settings.with_target,
            json_format: settings.json_format,
            directives: settings.directives.clone(),
        }
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut filter = EnvFilter::new(self.level.as_str());
        for directive in &self.directives {
            let parsed = directive.parse().map_err(|e| {
                LoggingError::InvalidConfiguration(format!("directive '{directive}': {e}"))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize logging with custom configuration
///
/// # Example
/// ```
/// use tradenet_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug)
///     .with_target(false)
///     .directive("tradenet_core::core_router=trace");
///
/// init_logging_with_config(config).expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (config.json_format, config.with_timestamp) {
        (true, true) => registry
            .with(fmt::layer().with_writer(std::io::stderr).json().with_target(config.with_target))
            .try_init(),
        (true, false) => registry
            .with(fmt::layer().with_writer(std::io::stderr).json().with_target(config.with_target).without_time())
            .try_init(),
        (false, true) => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(config.with_target))
            .try_init(),
        (false, false) => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(config.with_target).without_time())
            .try_init(),
    };
    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}
