use std::path::{Path, PathBuf};

use tracing::{debug, Span};
use warden_config::{ConfigurationLoader, GenericConfiguration};
use warden_error::{ErrorContext as _, GenericError};
use warden_kernel::{FactoryContext, Kernel, KernelHandle, KernelOutcome, Module, ModuleFactories, ModuleOptions};

use crate::logging::{initialize_logging, LoggingConfiguration};

const DEFAULT_ENV_PREFIX: &str = "WARDEN";

/// Builder for [`Application`].
pub struct ApplicationBuilder {
    config_file: Option<PathBuf>,
    env_prefix: &'static str,
    logging: bool,
}

impl ApplicationBuilder {
    /// Creates a new `ApplicationBuilder`.
    ///
    /// By default, configuration is only read from environment variables prefixed with `WARDEN_`, and logging is
    /// initialized when building.
    pub fn new() -> Self {
        Self {
            config_file: None,
            env_prefix: DEFAULT_ENV_PREFIX,
            logging: true,
        }
    }

    /// Reads configuration from the given file.
    ///
    /// Files ending in `.json` are read as JSON, and anything else as YAML. Environment variables take precedence over
    /// values from the file.
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the prefix of environment variables to read configuration from.
    pub fn with_env_prefix(mut self, prefix: &'static str) -> Self {
        self.env_prefix = prefix;
        self
    }

    /// Sets whether or not logging is initialized when building.
    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    /// Builds the application.
    ///
    /// # Errors
    ///
    /// If the configuration file cannot be read, the configuration is invalid, or logging cannot be initialized, an
    /// error is returned.
    pub fn build(self) -> Result<Application, GenericError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = &self.config_file {
            let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            loader = if is_json {
                loader.from_json(path)
            } else {
                loader.from_yaml(path)
            }
            .with_error_context(|| format!("Failed to load configuration from '{}'.", path.display()))?;
        }

        let config = loader.from_environment(self.env_prefix)?.into_generic();

        if self.logging {
            let logging_config = LoggingConfiguration::from_configuration(&config)?;
            initialize_logging(&logging_config)?;
        }

        let kernel = Kernel::from_configuration(config)?;
        debug!(config_file = ?self.config_file, env_prefix = self.env_prefix, "Application configured.");

        Ok(Application { kernel })
    }
}

/// An application.
///
/// Couples configuration loading and logging initialization with a [`Kernel`] that runs the application's modules.
pub struct Application {
    kernel: Kernel,
}

impl Application {
    /// Returns the configuration.
    pub fn config(&self) -> &GenericConfiguration {
        self.kernel.config()
    }

    /// Returns a handle to the underlying kernel.
    pub fn handle(&self) -> KernelHandle {
        self.kernel.handle()
    }

    /// Registers a module.
    pub fn add<N, F>(&mut self, name: N, factory: F) -> &mut Self
    where
        N: Into<String>,
        F: FnOnce(&FactoryContext<'_>) -> Result<Box<dyn Module>, GenericError> + Send + 'static,
    {
        self.kernel.add(name, factory);
        self
    }

    /// Registers a module, overriding its stage and type.
    pub fn add_with_options<N, F>(&mut self, name: N, factory: F, options: ModuleOptions) -> &mut Self
    where
        N: Into<String>,
        F: FnOnce(&FactoryContext<'_>) -> Result<Box<dyn Module>, GenericError> + Send + 'static,
    {
        self.kernel.add_with_options(name, factory, options);
        self
    }

    /// Registers a module factory callback.
    pub fn add_factory<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&GenericConfiguration, &Span) -> Result<ModuleFactories, GenericError> + Send + 'static,
    {
        self.kernel.add_factory(callback);
        self
    }

    /// Replaces the underlying kernel's force-exit callback.
    pub fn with_force_exit<F>(mut self, force_exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.kernel = self.kernel.with_force_exit(force_exit);
        self
    }

    /// Runs the application until it stops.
    pub async fn run(self) -> KernelOutcome {
        self.kernel.run().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use async_trait::async_trait;
    use warden_kernel::{ModuleShutdown, ModuleType, Stage};

    use super::*;

    struct Once;

    #[async_trait]
    impl Module for Once {
        async fn boot(&mut self, config: &GenericConfiguration, _: &Span) -> Result<(), GenericError> {
            let greeting = config.get_typed::<String>("greeting")?;
            assert_eq!(greeting, "hello");
            Ok(())
        }

        async fn run(&mut self, _: ModuleShutdown) -> Result<(), GenericError> {
            Ok(())
        }
    }

    fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn runs_modules_with_file_configuration() {
        let file = config_file(
            ".yaml",
            "greeting: hello\nkernel:\n  kill_timeout_secs: 1.5\n  handle_signals: false\n",
        );

        let mut app = ApplicationBuilder::new()
            .with_config_file(file.path())
            .with_env_prefix("WARDENAPPTEST")
            .with_logging(false)
            .build()
            .unwrap()
            .with_force_exit(|code| panic!("unexpected forced exit with code {}", code));

        assert_eq!(app.config().get_typed::<f64>("kernel.kill_timeout_secs").unwrap(), 1.5);

        app.add_with_options(
            "once",
            |_| Ok(Box::new(Once)),
            ModuleOptions::default()
                .with_type(ModuleType::Foreground)
                .with_stage(Stage::SERVICE),
        );

        let outcome = app.run().await;
        assert!(outcome.is_clean_stop());
    }

    #[test]
    fn reads_json_configuration() {
        let file = config_file(".json", r#"{ "greeting": "hello" }"#);

        let app = ApplicationBuilder::new()
            .with_config_file(file.path())
            .with_env_prefix("WARDENAPPTEST")
            .with_logging(false)
            .build()
            .unwrap();

        assert_eq!(app.config().get_typed::<String>("greeting").unwrap(), "hello");
    }

    #[test]
    fn missing_configuration_file_is_an_error() {
        let result = ApplicationBuilder::new()
            .with_config_file("/nonexistent/warden/config.yaml")
            .with_env_prefix("WARDENAPPTEST")
            .with_logging(false)
            .build();

        let error = result.err().expect("missing configuration file should be an error");
        assert!(error.to_string().contains("/nonexistent/warden/config.yaml"));
    }

    #[test]
    fn invalid_kernel_configuration_is_an_error() {
        let file = config_file(".yaml", "kernel:\n  kill_timeout_secs: -5\n");

        let result = ApplicationBuilder::new()
            .with_config_file(file.path())
            .with_env_prefix("WARDENAPPTEST")
            .with_logging(false)
            .build();

        assert!(result.is_err());
    }
}
