use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument as _};
use warden_config::GenericConfiguration;
use warden_error::{ErrorContext as _, GenericError};

use crate::{
    error::KernelError,
    module::Module,
    registry::{FactoryContext, ModuleFactories, ModuleFactory, ModuleOptions, ModuleRegistry},
    shutdown::{DrainResult, ShutdownCoordinator, ShutdownLatch},
    stage::StageMap,
    supervisor::{spawn_signal_listener, Supervisor},
};

const fn default_kill_timeout_secs() -> f64 {
    10.0
}

const fn default_handle_signals() -> bool {
    true
}

/// Kernel configuration.
///
/// Read from the `kernel` section of the configuration:
///
/// ```yaml
/// kernel:
///   kill_timeout_secs: 10.0
///   handle_signals: true
/// ```
#[derive(Clone, Debug)]
pub struct KernelConfiguration {
    /// How long the kernel waits for every module to return once it starts stopping, in seconds.
    ///
    /// When the timeout elapses, the force-exit callback is invoked. Defaults to 10 seconds.
    pub kill_timeout_secs: f64,

    /// Whether or not the kernel stops when the process receives SIGINT or SIGTERM.
    ///
    /// Defaults to `true`.
    pub handle_signals: bool,
}

impl KernelConfiguration {
    /// Reads the kernel configuration from the given configuration.
    ///
    /// Missing values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// If a value is present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let kill_timeout_secs = config
            .try_get_typed("kernel.kill_timeout_secs")?
            .unwrap_or_else(default_kill_timeout_secs);
        let handle_signals = config
            .try_get_typed("kernel.handle_signals")?
            .unwrap_or_else(default_handle_signals);

        let kernel_config = Self {
            kill_timeout_secs,
            handle_signals,
        };

        kernel_config.kill_timeout()?;
        Ok(kernel_config)
    }

    /// Returns the kill timeout.
    ///
    /// # Errors
    ///
    /// If the kill timeout is negative, or not a finite number, an error is returned.
    pub fn kill_timeout(&self) -> Result<Duration, GenericError> {
        Duration::try_from_secs_f64(self.kill_timeout_secs).with_error_context(|| {
            format!(
                "Invalid kill timeout `kernel.kill_timeout_secs` ({}): must be a non-negative number of seconds.",
                self.kill_timeout_secs
            )
        })
    }
}

impl Default for KernelConfiguration {
    fn default() -> Self {
        Self {
            kill_timeout_secs: default_kill_timeout_secs(),
            handle_signals: default_handle_signals(),
        }
    }
}

/// Kernel state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelState {
    /// The kernel has been created but not yet started.
    Created,

    /// Modules are being created and booted.
    Booting,

    /// Modules are running.
    Running,

    /// The kernel is stopping its modules.
    Stopping,

    /// The kernel has finished running.
    Stopped,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How a kernel run ended.
#[derive(Debug)]
pub enum KernelOutcome {
    /// No modules were registered, so nothing was run.
    NothingToRun,

    /// A module factory callback failed, so no modules were created.
    FactoriesFailed(KernelError),

    /// A module failed to be created or booted, so no modules were run.
    BootFailed(KernelError),

    /// Every module stopped within the kill timeout.
    Stopped {
        /// Why the kernel stopped.
        reason: String,
    },

    /// Modules failed to stop within the kill timeout, and the force-exit callback was invoked.
    ForcedExit {
        /// Why the kernel began stopping.
        reason: String,
    },
}

impl KernelOutcome {
    /// Returns `true` if the kernel ran its modules and they all stopped within the kill timeout.
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// Returns the stop reason, if the kernel got as far as running its modules.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Stopped { reason } | Self::ForcedExit { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct StateCell(Arc<Mutex<KernelState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(KernelState::Created)))
    }

    fn get(&self) -> KernelState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: KernelState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// A handle to a kernel.
///
/// Handles can be cloned freely and used from any thread, including from within modules.
#[derive(Clone, Debug)]
pub struct KernelHandle {
    latch: ShutdownLatch,
    state: StateCell,
}

impl KernelHandle {
    /// Requests the kernel to stop, with the given reason.
    ///
    /// Only the first request has any effect: it returns `true`, and its reason is the one reported by the kernel. Every
    /// subsequent request returns `false`. A request made before the kernel has started running causes the kernel to
    /// stop as soon as all of its modules have booted.
    pub fn stop<R: Into<String>>(&self, reason: R) -> bool {
        self.latch.fire(reason)
    }

    /// Returns the current state of the kernel.
    ///
    /// The kernel is reported as stopping as soon as it has been asked to stop, even if it is still booting its modules
    /// or has not started running yet.
    pub fn state(&self) -> KernelState {
        match self.state.get() {
            KernelState::Stopped => KernelState::Stopped,
            _ if self.latch.reason().is_some() => KernelState::Stopping,
            state => state,
        }
    }

    /// Returns the reason the kernel is stopping, if it has been asked to stop.
    pub fn stop_reason(&self) -> Option<String> {
        self.latch.reason()
    }
}

type ForceExit = Arc<dyn Fn(i32) + Send + Sync>;

/// Module lifecycle kernel.
///
/// The kernel owns a set of modules, and drives them through their lifecycle:
///
/// - all module factory callbacks are resolved, adding any modules they produce
/// - every module is created and booted, one at a time, in registration order
/// - every module is run concurrently, grouped by [`Stage`][crate::Stage]
/// - once the kernel is asked to stop, or decides to stop on its own, stages are stopped from the highest to the lowest
///
/// The kernel decides to stop on its own when an essential module finishes, when all essential and foreground modules
/// have finished, or when the process receives SIGINT or SIGTERM. If modules fail to stop within the kill timeout, the
/// force-exit callback is invoked, which exits the process by default.
pub struct Kernel {
    config: GenericConfiguration,
    registry: ModuleRegistry,
    kill_timeout: Duration,
    handle_signals: bool,
    force_exit: ForceExit,
    latch: ShutdownLatch,
    state: StateCell,
}

impl Kernel {
    /// Creates a new `Kernel` with the default kernel settings.
    ///
    /// `config` is handed to every module factory and to `boot`, but the kernel settings themselves are not read from
    /// it. Use [`from_configuration`][Self::from_configuration] for that.
    pub fn new(config: GenericConfiguration) -> Self {
        let kernel_config = KernelConfiguration::default();
        let kill_timeout = Duration::from_secs_f64(kernel_config.kill_timeout_secs);
        Self::from_parts(config, kernel_config.handle_signals, kill_timeout)
    }

    /// Creates a new `Kernel`, reading its settings from the `kernel` section of `config`.
    ///
    /// # Errors
    ///
    /// If the kernel settings are invalid, an error is returned.
    pub fn from_configuration(config: GenericConfiguration) -> Result<Self, GenericError> {
        let kernel_config = KernelConfiguration::from_configuration(&config)?;
        let kill_timeout = kernel_config.kill_timeout()?;
        Ok(Self::from_parts(config, kernel_config.handle_signals, kill_timeout))
    }

    fn from_parts(config: GenericConfiguration, handle_signals: bool, kill_timeout: Duration) -> Self {
        Self {
            config,
            registry: ModuleRegistry::default(),
            kill_timeout,
            handle_signals,
            force_exit: Arc::new(|code| std::process::exit(code)),
            latch: ShutdownLatch::default(),
            state: StateCell::new(),
        }
    }

    /// Sets the kill timeout.
    pub fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    /// Sets the force-exit callback.
    ///
    /// The callback is invoked with an exit code of 1 if modules fail to stop within the kill timeout. Defaults to
    /// [`std::process::exit`].
    pub fn with_force_exit<F>(mut self, force_exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.force_exit = Arc::new(force_exit);
        self
    }

    /// Sets whether or not the kernel stops when the process receives SIGINT or SIGTERM.
    pub fn with_signal_handling(mut self, handle_signals: bool) -> Self {
        self.handle_signals = handle_signals;
        self
    }

    /// Registers a module.
    pub fn add<N, F>(&mut self, name: N, factory: F) -> &mut Self
    where
        N: Into<String>,
        F: FnOnce(&FactoryContext<'_>) -> Result<Box<dyn Module>, GenericError> + Send + 'static,
    {
        self.add_with_options(name, factory, ModuleOptions::default())
    }

    /// Registers a module, overriding its stage and type.
    pub fn add_with_options<N, F>(&mut self, name: N, factory: F, options: ModuleOptions) -> &mut Self
    where
        N: Into<String>,
        F: FnOnce(&FactoryContext<'_>) -> Result<Box<dyn Module>, GenericError> + Send + 'static,
    {
        let factory: ModuleFactory = Box::new(factory);
        self.registry.add(name.into(), factory, options);
        self
    }

    /// Registers a module factory callback.
    ///
    /// Callbacks are resolved once, at startup, before any module is created. Modules they produce are created after all
    /// modules registered directly, and use their declared stage and type.
    pub fn add_factory<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&GenericConfiguration, &tracing::Span) -> Result<ModuleFactories, GenericError> + Send + 'static,
    {
        self.registry.add_callback(Box::new(callback));
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &GenericConfiguration {
        &self.config
    }

    /// Returns a handle to the kernel.
    pub fn handle(&self) -> KernelHandle {
        KernelHandle {
            latch: self.latch.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs the kernel until it stops.
    ///
    /// Failures while creating or booting modules are logged and reported through the returned outcome, and no modules
    /// are run. Otherwise, this returns once every module has stopped, or once the kill timeout has elapsed and the
    /// force-exit callback has been invoked.
    pub async fn run(self) -> KernelOutcome {
        let span = info_span!("kernel");
        let inner_span = span.clone();
        self.run_inner(inner_span).instrument(span).await
    }

    async fn run_inner(self, span: tracing::Span) -> KernelOutcome {
        let Self {
            config,
            mut registry,
            kill_timeout,
            handle_signals,
            force_exit,
            latch,
            state,
        } = self;

        state.set(KernelState::Booting);

        // Anything derived from the root token is cancelled once the kernel returns, no matter how it returns.
        let root = CancellationToken::new();
        let _root_guard = root.clone().drop_guard();

        // Signals received while modules are booting still stop the kernel, right after boot completes.
        let signal_listener = if handle_signals {
            spawn_signal_listener(latch.clone())
        } else {
            None
        };
        let stop_early = |outcome: KernelOutcome| {
            if let Some(listener) = &signal_listener {
                listener.abort();
            }
            state.set(KernelState::Stopped);
            outcome
        };

        if let Err(e) = registry.resolve_callbacks(&config, &span) {
            error!(error = %e, "Failed to build additional modules from module factories.");
            return stop_early(KernelOutcome::FactoriesFailed(e));
        }

        let modules = match registry.boot_all(&root, &config, &span).await {
            Ok(modules) => modules,
            Err(e) => {
                error!(error = %e, "Failed to build modules.");
                return stop_early(KernelOutcome::BootFailed(e));
            }
        };

        let stages = StageMap::classify(modules);
        if stages.is_empty() {
            warn!("Nothing to run.");
            return stop_early(KernelOutcome::NothingToRun);
        }

        state.set(KernelState::Running);

        let supervisor = Supervisor::new(latch.clone());
        let running = supervisor.spawn(stages, &root);
        info!(stages = running.len(), "Kernel running.");

        latch.wait().await;

        state.set(KernelState::Stopping);
        let reason = latch.reason().unwrap_or_default();
        info!("Kernel stopping: {}", reason);

        let coordinator = ShutdownCoordinator::new(kill_timeout, force_exit.as_ref());
        let result = coordinator.drain(running).await;

        if let Some(listener) = signal_listener {
            listener.abort();
        }

        state.set(KernelState::Stopped);

        match result {
            DrainResult::Drained => {
                info!("Kernel stopped.");
                KernelOutcome::Stopped { reason }
            }
            DrainResult::TimedOut => KernelOutcome::ForcedExit { reason },
        }
    }
}
