use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    pin, select,
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::supervisor::RunningStage;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// A shutdown signal for a module.
///
/// Every module in a stage receives a clone of the same signal, which is triggered once the kernel begins stopping that
/// stage. Signals are derived from the kernel's root signal, so anything the kernel cancels wholesale is observed here
/// as well.
#[derive(Clone, Debug)]
pub struct ModuleShutdown {
    token: CancellationToken,
}

/// A handle to trigger shutdown of every module holding a paired [`ModuleShutdown`].
#[derive(Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ModuleShutdown {
    /// Creates a new `ModuleShutdown` and `ShutdownHandle` pair.
    ///
    /// When `ShutdownHandle` is triggered, `ModuleShutdown`, and all of its clones, will resolve.
    pub fn paired() -> (Self, ShutdownHandle) {
        Self::from_token(CancellationToken::new())
    }

    /// Creates a new `ModuleShutdown` and `ShutdownHandle` pair derived from `parent`.
    ///
    /// The resulting `ModuleShutdown` resolves when either the handle is triggered or `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> (Self, ShutdownHandle) {
        Self::from_token(parent.child_token())
    }

    fn from_token(token: CancellationToken) -> (Self, ShutdownHandle) {
        let handle = ShutdownHandle { token: token.clone() };
        (Self { token }, handle)
    }

    /// Creates a new `ModuleShutdown` that never resolves.
    ///
    /// This is useful for cases where a `ModuleShutdown` is required, but no shutdown signal is expected.
    pub fn noop() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Waits for the shutdown signal to be received.
    ///
    /// Returns immediately if the signal has already been received.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns a cancellation token that is cancelled along with this signal.
    ///
    /// Useful for handing the signal down to work spawned by the module itself.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl ShutdownHandle {
    /// Triggers shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

/// A fire-once shutdown latch.
///
/// The first call to [`fire`][ShutdownLatch::fire] records the reason and wakes every waiter. Subsequent calls are
/// no-ops, and the first reason is kept.
#[derive(Clone, Debug, Default)]
pub(crate) struct ShutdownLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug, Default)]
struct LatchInner {
    reason: Mutex<Option<String>>,
    fired: CancellationToken,
}

impl ShutdownLatch {
    /// Fires the latch with the given reason.
    ///
    /// Returns `true` if this call fired the latch, or `false` if it had already been fired.
    pub fn fire<R: Into<String>>(&self, reason: R) -> bool {
        let mut current = self.inner.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return false;
        }

        *current = Some(reason.into());
        self.inner.fired.cancel();
        true
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Waits until the latch has been fired.
    pub async fn wait(&self) {
        self.inner.fired.cancelled().await
    }
}

/// Outcome of draining the running stages.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum DrainResult {
    /// Every module in every stage returned before the kill timeout elapsed.
    Drained,

    /// The kill timeout elapsed while waiting for modules to return, and the force-exit callback was invoked.
    TimedOut,
}

/// Stops running stages in reverse order.
pub(crate) struct ShutdownCoordinator<'a> {
    kill_timeout: Duration,
    force_exit: &'a (dyn Fn(i32) + Send + Sync),
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(kill_timeout: Duration, force_exit: &'a (dyn Fn(i32) + Send + Sync)) -> Self {
        Self {
            kill_timeout,
            force_exit,
        }
    }

    /// Drains the given stages, from the highest stage to the lowest.
    ///
    /// Each stage is signalled to stop, and every one of its module tasks must return, before the next lower stage is
    /// signalled. A single deadline of `kill_timeout` covers the whole drain. If the deadline elapses, the force-exit
    /// callback is invoked with an exit code of 1 and any module tasks still running are aborted.
    ///
    /// `stages` must be ordered from the lowest stage to the highest.
    pub async fn drain(&self, mut stages: Vec<RunningStage>) -> DrainResult {
        let deadline = sleep(self.kill_timeout);
        pin!(deadline);

        let mut progress = interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        progress.tick().await;

        while let Some(mut running) = stages.pop() {
            let stage = running.stage();
            debug!(%stage, modules = running.remaining(), "Stopping stage.");

            running.trigger_shutdown();

            loop {
                select! {
                    result = running.join_next() => match result {
                        Some(Ok(())) => {},
                        Some(Err(e)) => warn!(%stage, error = %e, "Module task did not complete normally."),
                        None => break,
                    },
                    _ = progress.tick() => {
                        info!(%stage, "Waiting for {} module(s) in stage {} to stop...", running.remaining(), stage);
                    },
                    _ = &mut deadline => {
                        error!(%stage, modules = running.remaining(), "Kernel failed to stop within the kill timeout, forcing exit.");
                        (self.force_exit)(1);

                        // Anything still running is aborted when the stages are dropped.
                        return DrainResult::TimedOut;
                    },
                }
            }

            debug!(%stage, "Stage stopped.");
        }

        DrainResult::Drained
    }
}
