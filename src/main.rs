mod backend;
mod cache;
mod config;
mod core;
mod jobs;
mod queue;
mod runner;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::ensure_cache_dir;
use crate::config::WorkerConfig;
use crate::jobs::JobProcessor;
use crate::queue::QueueConsumer;

/// Exit status for a forced stop (128 + SIGINT)
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, PartialEq, Eq)]
enum InterruptAction {
    /// Finish the running job, then stop
    Drain,
    /// Leave immediately without settling the running job
    ForceExit,
}

fn interrupt_action(count: usize) -> InterruptAction {
    if count <= 1 {
        InterruptAction::Drain
    } else {
        InterruptAction::ForceExit
    }
}

/// First Ctrl-C drains, the second one exits the process.
///
/// An unsettled delivery is redelivered by the broker after a forced exit.
async fn watch_interrupts(shutdown: CancellationToken) {
    let mut count = 0;
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt signal: {}", e);
            return;
        }
        count += 1;
        match interrupt_action(count) {
            InterruptAction::Drain => {
                info!("Interrupt received, stopping after the current job (Ctrl-C again to force)");
                shutdown.cancel();
            }
            InterruptAction::ForceExit => {
                warn!("Second interrupt received, exiting without finishing the current job");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("eval_worker=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().inspect_err(|e| error!("Error: {}", e))?;

    info!("{}", "=".repeat(50));
    info!("  Remote Evaluation Worker");
    info!("{}", "=".repeat(50));
    info!("RabbitMQ: {}:{}", config.broker.host, config.broker.port);
    info!("Queue: {}", config.broker.queue);
    info!("Backend: {}", config.backend.base_uri);
    info!("Evaluation timeout: {}s", config.eval_timeout.as_secs());

    ensure_cache_dir(&config.cache_dir)
        .await
        .context("Failed to create evaluation cache directory")?;
    info!("Evaluation cache at {:?}", config.cache_dir);

    let processor =
        JobProcessor::from_config(&config).context("Failed to initialize backend client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_interrupts(shutdown.clone()));

    QueueConsumer::new(config.broker.clone(), Arc::new(processor))
        .run(shutdown)
        .await;

    info!("Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_action() {
        assert_eq!(interrupt_action(1), InterruptAction::Drain);
        assert_eq!(interrupt_action(2), InterruptAction::ForceExit);
        assert_eq!(interrupt_action(5), InterruptAction::ForceExit);
    }
}
