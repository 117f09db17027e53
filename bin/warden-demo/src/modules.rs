use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    select,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, info, Span};
use warden_config::GenericConfiguration;
use warden_error::{generic_error, ErrorContext as _, GenericError};
use warden_kernel::{FactoryContext, Module, ModuleFactories, ModuleFactory, ModuleShutdown, ModuleType, Stage};

const fn default_tick_interval_secs() -> f64 {
    1.0
}

const fn default_heartbeat_interval_secs() -> f64 {
    2.0
}

const fn default_workers() -> usize {
    2
}

const fn default_iterations() -> u64 {
    5
}

fn interval_from_config(config: &GenericConfiguration, key: &str, default_secs: f64) -> Result<Duration, GenericError> {
    let secs = config.try_get_typed::<f64>(key)?.unwrap_or(default_secs);
    Duration::try_from_secs_f64(secs).with_error_context(|| format!("Invalid interval for `{}`: {}", key, secs))
}

/// Counts ticks for as long as the process runs.
///
/// Lives in the essential stage, so it is the last module to be told to stop.
#[derive(Default)]
pub struct Ticker {
    period: Duration,
    ticks: u64,
}

#[async_trait]
impl Module for Ticker {
    async fn boot(&mut self, config: &GenericConfiguration, span: &Span) -> Result<(), GenericError> {
        self.period = interval_from_config(config, "demo.tick_interval_secs", default_tick_interval_secs())?;
        if self.period.is_zero() {
            return Err(generic_error!("Tick interval must be greater than zero."));
        }

        debug!(parent: span, period = ?self.period, "Ticker booted.");
        Ok(())
    }

    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = ticker.tick() => {
                    self.ticks += 1;
                    debug!(ticks = self.ticks, "Tick.");
                }
            }
        }

        info!(ticks = self.ticks, "Ticker stopped.");
        Ok(())
    }

    fn module_type(&self) -> Option<ModuleType> {
        Some(ModuleType::Background)
    }

    fn stage(&self) -> Option<Stage> {
        Some(Stage::ESSENTIAL)
    }
}

/// Periodically reports that the process is alive.
#[derive(Default)]
pub struct Heartbeat {
    period: Duration,
}

#[async_trait]
impl Module for Heartbeat {
    async fn boot(&mut self, config: &GenericConfiguration, _: &Span) -> Result<(), GenericError> {
        self.period = interval_from_config(config, "demo.heartbeat_interval_secs", default_heartbeat_interval_secs())?;
        if self.period.is_zero() {
            return Err(generic_error!("Heartbeat interval must be greater than zero."));
        }

        Ok(())
    }

    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError> {
        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => return Ok(()),
                _ = sleep(self.period) => info!("Heartbeat."),
            }
        }
    }

    fn module_type(&self) -> Option<ModuleType> {
        Some(ModuleType::Background)
    }

    fn stage(&self) -> Option<Stage> {
        Some(Stage::SERVICE)
    }
}

/// Does a fixed amount of work, and then finishes.
///
/// Once every worker has finished, the kernel stops on its own.
pub struct Worker {
    id: usize,
    iterations: u64,
    delay: Duration,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            iterations: default_iterations(),
            delay: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Module for Worker {
    async fn boot(&mut self, config: &GenericConfiguration, _: &Span) -> Result<(), GenericError> {
        self.iterations = config
            .try_get_typed("demo.iterations")?
            .unwrap_or_else(default_iterations);
        self.delay = interval_from_config(config, "demo.work_delay_secs", 0.5)?;
        Ok(())
    }

    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError> {
        for iteration in 1..=self.iterations {
            select! {
                _ = shutdown.wait_for_shutdown() => {
                    info!(worker = self.id, iteration, "Worker interrupted.");
                    return Ok(());
                },
                _ = sleep(self.delay) => {
                    debug!(worker = self.id, iteration, "Worker finished iteration.");
                },
            }
        }

        info!(worker = self.id, iterations = self.iterations, "Worker done.");
        Ok(())
    }
}

/// Creates one worker per `demo.workers`.
pub fn worker_factories(config: &GenericConfiguration, span: &Span) -> Result<ModuleFactories, GenericError> {
    let workers = config.try_get_typed("demo.workers")?.unwrap_or_else(default_workers);
    debug!(parent: span, workers, "Creating workers.");

    let mut factories = ModuleFactories::new();
    for id in 0..workers {
        let factory: ModuleFactory =
            Box::new(move |_: &FactoryContext<'_>| Ok(Box::new(Worker::new(id)) as Box<dyn Module>));
        factories.insert(format!("worker-{}", id), factory);
    }

    Ok(factories)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_config::ConfigurationLoader;

    use super::*;

    fn config(values: serde_json::Value) -> GenericConfiguration {
        ConfigurationLoader::default().from_serialized(values).into_generic()
    }

    #[tokio::test]
    async fn zero_intervals_are_rejected() {
        let config = config(json!({ "demo": { "tick_interval_secs": 0.0, "heartbeat_interval_secs": 0.0 } }));
        let span = Span::none();

        let ticker_error = Ticker::default().boot(&config, &span).await.unwrap_err();
        assert!(ticker_error.to_string().contains("Tick interval"));

        let heartbeat_error = Heartbeat::default().boot(&config, &span).await.unwrap_err();
        assert!(heartbeat_error.to_string().contains("Heartbeat interval"));
    }

    #[tokio::test]
    async fn default_intervals_boot() {
        let config = GenericConfiguration::empty();
        let span = Span::none();

        let mut heartbeat = Heartbeat::default();
        heartbeat.boot(&config, &span).await.unwrap();
        assert_eq!(heartbeat.period, Duration::from_secs(2));
    }

    #[test]
    fn one_worker_per_configured_worker() {
        let factories = worker_factories(&config(json!({ "demo": { "workers": 3 } })), &Span::none()).unwrap();

        assert_eq!(factories.keys().collect::<Vec<_>>(), vec!["worker-0", "worker-1", "worker-2"]);
    }
}
