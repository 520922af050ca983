//! The worker loop: block on the queue, dispatch jobs, shut down cleanly.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::queue::JobQueue;
use crate::runner::JobRunner;

/// Queue pop timeout per loop iteration.
const POP_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff after a queue transport error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct Worker {
    queue: JobQueue,
    runner: JobRunner,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(queue: JobQueue, runner: JobRunner, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            runner,
            shutdown,
        }
    }

    /// Run until shutdown is requested. A job in flight when the signal
    /// arrives is allowed to finish; the loop exits afterwards.
    pub async fn run(&self) {
        info!("Worker started and waiting for jobs");

        while !self.shutdown.is_cancelled() {
            match self.queue.pop(POP_TIMEOUT).await {
                Ok(Some(job_id)) => {
                    info!(job_id, "Received job");
                    self.runner.process_job(&job_id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Queue error, reconnecting");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        info!("Worker shutting down");
    }
}
