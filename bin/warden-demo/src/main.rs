use std::time::Instant;

use tracing::{error, info, warn};
use warden_app::prelude::*;
use warden_kernel::KernelOutcome;

mod modules;
use self::modules::{worker_factories, Heartbeat, Ticker};

#[tokio::main]
async fn main() {
    let started = Instant::now();

    let mut builder = ApplicationBuilder::new();
    if let Some(config_file) = std::env::args().nth(1) {
        builder = builder.with_config_file(config_file);
    }

    let mut app = match builder.build() {
        Ok(app) => app,
        Err(e) => fatal_and_exit(format!("failed to build application: {:#}", e)),
    };

    app.add("ticker", |_| Ok(Box::new(Ticker::default())))
        .add("heartbeat", |_| Ok(Box::new(Heartbeat::default())))
        .add_factory(worker_factories);

    info!("Demo starting.");

    match app.run().await {
        KernelOutcome::Stopped { reason } => {
            info!(run_time_ms = started.elapsed().as_millis(), "Demo stopped: {}", reason)
        }
        KernelOutcome::NothingToRun => warn!("Demo had nothing to run."),
        KernelOutcome::ForcedExit { reason } => {
            error!("Demo failed to stop cleanly after: {}", reason);
            std::process::exit(1);
        }
        KernelOutcome::FactoriesFailed(e) | KernelOutcome::BootFailed(e) => {
            error!("Demo failed to start: {}", e);
            std::process::exit(1);
        }
    }
}
