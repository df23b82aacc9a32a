//! Periodic sweep for ready jobs and queued retriggers.

use crate::trigger::DeploymentTrigger;
use rollout_trace::sweep_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{Instrument, debug, error, info};

/// Drives a [`DeploymentTrigger`] on a fixed interval.
pub struct Sweeper {
    trigger: Arc<DeploymentTrigger>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(trigger: Arc<DeploymentTrigger>) -> Self {
        let interval = trigger.config().sweep_interval();
        Self { trigger, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!(
            interval_secs = self.interval.as_secs(),
            "Starting deployment sweeper"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Deployment sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Roll out new revisions, trigger ready jobs, then process the retrigger queue.
    /// Failures are logged, not returned.
    pub async fn run_once(&self) {
        self.sweep().instrument(sweep_span()).await
    }

    async fn sweep(&self) {
        if let Err(e) = self.trigger.trigger_new_revisions().await {
            error!(error = %e, "Failed to roll out new revisions");
        }
        match self.trigger.trigger_ready_jobs().await {
            Ok(triggered) => debug!(triggered, "Triggered ready jobs"),
            Err(e) => error!(error = %e, "Failed to trigger ready jobs"),
        }
        match self.trigger.process_retrigger_queue().await {
            Ok(triggered) => debug!(triggered, "Processed retrigger queue"),
            Err(e) => error!(error = %e, "Failed to process retrigger queue"),
        }
    }
}
