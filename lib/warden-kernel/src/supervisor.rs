use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};

use futures::FutureExt as _;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn, Instrument as _};
use warden_error::panic_to_error;

use crate::{
    error::KernelError,
    module::{ModuleType, Stage},
    shutdown::{ModuleShutdown, ShutdownHandle, ShutdownLatch},
    stage::{ClassifiedModule, StageMap},
};

/// Number of running modules per stage and type.
#[derive(Debug, Default)]
pub(crate) struct RunningCounts {
    counts: Mutex<HashMap<(Stage, ModuleType), usize>>,
}

impl RunningCounts {
    pub fn increment(&self, stage: Stage, module_type: ModuleType, count: usize) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry((stage, module_type)).or_default() += count;
    }

    /// Records that a module has finished.
    ///
    /// Returns `true` if no essential or foreground modules remain running, across all stages.
    pub fn decrement(&self, stage: Stage, module_type: ModuleType) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(&(stage, module_type)) {
            *count = count.saturating_sub(1);
        }

        Self::none_alive(&counts)
    }

    fn none_alive(counts: &HashMap<(Stage, ModuleType), usize>) -> bool {
        counts
            .iter()
            .filter(|((_, module_type), _)| module_type.keeps_kernel_alive())
            .all(|(_, count)| *count == 0)
    }
}

/// The running modules of a single stage.
pub(crate) struct RunningStage {
    stage: Stage,
    shutdown_handle: ShutdownHandle,
    tasks: JoinSet<()>,
}

impl RunningStage {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn remaining(&self) -> usize {
        self.tasks.len()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown_handle.trigger();
    }

    pub async fn join_next(&mut self) -> Option<Result<(), JoinError>> {
        self.tasks.join_next().await
    }
}

/// Runs modules and decides when the kernel should stop on its own.
///
/// Each module runs on its own task. When a module finishes:
///
/// - if it is essential, the shutdown latch is fired immediately
/// - if it is foreground, the shutdown latch is fired once no essential or foreground modules remain running
///
/// Background modules finishing never fire the latch.
pub(crate) struct Supervisor {
    latch: ShutdownLatch,
    counts: Arc<RunningCounts>,
}

impl Supervisor {
    pub fn new(latch: ShutdownLatch) -> Self {
        Self {
            latch,
            counts: Arc::new(RunningCounts::default()),
        }
    }

    /// Spawns every module in `stages`.
    ///
    /// Each stage gets its own shutdown signal derived from `root`. Running counts are fully populated before any module
    /// task is spawned, so a module finishing early can never observe a partially counted kernel.
    ///
    /// Returns the running stages, ordered from the lowest stage to the highest.
    pub fn spawn(&self, stages: StageMap, root: &CancellationToken) -> Vec<RunningStage> {
        for (stage, modules) in stages.iter() {
            for module_type in [ModuleType::Essential, ModuleType::Foreground, ModuleType::Background] {
                self.counts.increment(*stage, module_type, modules.count(module_type));
            }
        }

        let mut running = Vec::new();
        for (stage, modules) in stages.into_stages() {
            let (shutdown, shutdown_handle) = ModuleShutdown::child_of(root);
            let mut tasks = JoinSet::new();

            debug!(%stage, modules = modules.len(), "Starting stage.");

            for module in modules.into_modules() {
                let module_span = debug_span!("module", module_name = %module.name, %stage);
                let task = run_module(module, shutdown.clone(), self.latch.clone(), Arc::clone(&self.counts));
                tasks.spawn(task.instrument(module_span));
            }

            running.push(RunningStage {
                stage,
                shutdown_handle,
                tasks,
            });
        }

        running
    }
}

async fn run_module(
    module: ClassifiedModule, shutdown: ModuleShutdown, latch: ShutdownLatch, counts: Arc<RunningCounts>,
) {
    let ClassifiedModule {
        name,
        stage,
        module_type,
        mut module,
    } = module;

    debug!("Module started.");

    let result = AssertUnwindSafe(module.run(shutdown))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_to_error(payload)));

    match result {
        Ok(()) => debug!("Module stopped."),
        Err(source) => {
            let e = KernelError::ModuleRun {
                module_name: name.clone(),
                stage,
                source,
            };
            error!(error = %e, "Failed during execution of stage {}.", stage);
        }
    }

    let none_alive = counts.decrement(stage, module_type);
    match module_type {
        ModuleType::Essential => {
            latch.fire(format!("essential module '{}' stopped", name));
        }
        ModuleType::Foreground if none_alive => {
            latch.fire("all foreground modules stopped");
        }
        _ => {}
    }
}

/// Spawns a task which fires the shutdown latch when the process receives SIGINT or SIGTERM.
///
/// Signal handlers are registered before this function returns, so signals raised immediately afterwards are never
/// missed. If registration fails, a warning is logged and no listener is spawned.
#[cfg(unix)]
pub(crate) fn spawn_signal_listener(latch: ShutdownLatch) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to register signal handlers. Kernel will not stop on signals.");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        let signal_name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        latch.fire(format!("received signal {}", signal_name));
    }))
}

/// Spawns a task which fires the shutdown latch when the process receives Ctrl-C.
#[cfg(not(unix))]
pub(crate) fn spawn_signal_listener(latch: ShutdownLatch) -> Option<JoinHandle<()>> {
    Some(tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                latch.fire("received signal SIGINT");
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C. Kernel will not stop on signals."),
        }
    }))
}
