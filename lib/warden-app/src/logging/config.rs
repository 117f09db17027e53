use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use warden_config::GenericConfiguration;
use warden_error::{generic_error, ErrorContext as _, GenericError};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
///
/// Read from the root of the configuration, so with the default `WARDEN` environment prefix, the log level can be set
/// with `WARDEN_LOG_LEVEL` and JSON output enabled with `WARDEN_LOG_FORMAT_JSON`.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Log level filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether or not logs are emitted as JSON.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_false")]
    pub log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: default_false(),
        }
    }
}

/// Log level filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the filter for these directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        self.0.clone()
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = LoggingConfiguration::from_configuration(&GenericConfiguration::empty()).unwrap();

        assert_eq!(config.log_level.as_env_filter().to_string(), "info");
        assert!(!config.log_format_json);
    }

    #[test]
    fn reads_level_and_format() {
        let config = ConfigurationLoader::default()
            .from_serialized(json!({ "log_level": "warden_kernel=debug,warn", "log_format_json": true }))
            .into_generic();
        let logging_config = LoggingConfiguration::from_configuration(&config).unwrap();

        let directives = logging_config.log_level.as_env_filter().to_string();
        assert!(directives.contains("warden_kernel=debug"));
        assert!(directives.contains("warn"));
        assert!(logging_config.log_format_json);
    }

    #[test]
    fn rejects_empty_level() {
        assert!(LogLevel::try_from(String::new()).is_err());
    }
}
