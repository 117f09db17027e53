//! Signals are delivered to the whole process, so this lives in its own test binary, with a single test.
#![cfg(unix)]

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::Span;
use warden_config::GenericConfiguration;
use warden_error::GenericError;
use warden_kernel::{Kernel, KernelOutcome, Module, ModuleShutdown, ModuleType, Stage};

fn raise_sigterm() {
    // SAFETY: Sending a signal to our own process has no memory safety implications.
    let result = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    assert_eq!(result, 0, "failed to raise SIGTERM");
}

/// Raises SIGTERM against its own process after a few ticks, then waits to be told to stop.
///
/// With `during_boot` set, the signal is raised while booting instead.
struct Terminator {
    ticks: usize,
    during_boot: bool,
}

#[async_trait]
impl Module for Terminator {
    async fn boot(&mut self, _: &GenericConfiguration, _: &Span) -> Result<(), GenericError> {
        if self.during_boot {
            raise_sigterm();
            sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError> {
        if !self.during_boot {
            for _ in 0..self.ticks {
                sleep(Duration::from_millis(2)).await;
            }
            raise_sigterm();
        }

        shutdown.wait_for_shutdown().await;
        Ok(())
    }
}

struct Idle;

#[async_trait]
impl Module for Idle {
    async fn boot(&mut self, _: &GenericConfiguration, _: &Span) -> Result<(), GenericError> {
        Ok(())
    }

    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError> {
        shutdown.wait_for_shutdown().await;
        Ok(())
    }

    fn module_type(&self) -> Option<ModuleType> {
        Some(ModuleType::Background)
    }

    fn stage(&self) -> Option<Stage> {
        Some(Stage::SERVICE)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sigterm_stops_kernel() {
    for iteration in 0..10 {
        // Every other run raises the signal while its modules are still booting.
        let during_boot = iteration % 2 == 1;

        let mut kernel = Kernel::new(GenericConfiguration::empty())
            .with_kill_timeout(Duration::from_secs(5))
            .with_force_exit(|code| panic!("unexpected forced exit with code {}", code));
        kernel.add("terminator", move |_| Ok(Box::new(Terminator { ticks: 3, during_boot })));
        kernel.add("idle", |_| Ok(Box::new(Idle)));

        let outcome = timeout(Duration::from_secs(10), kernel.run())
            .await
            .expect("kernel should stop after SIGTERM");

        match outcome {
            KernelOutcome::Stopped { reason } => assert_eq!(reason, "received signal SIGTERM"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
