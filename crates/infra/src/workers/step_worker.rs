use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use docpipe_core::StepName;

use super::stats::{WorkerStats, WorkerStatsSnapshot};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::queue::{MessageQueue, QueueError, QueueMessage};

/// Dead letters re-applied by the first worker of each step on startup.
const RECOVERY_SCAN_LIMIT: usize = 100;

/// Spawns the pollers for every step the orchestrator has a queue for.
#[derive(Debug)]
pub struct WorkerPool;

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPoolHandle {
    /// Stop polling, let in-flight deliveries settle, and wait for every worker.
    ///
    /// Handlers see their cancellation token fire; a handler that fails
    /// because of it has its message released without counting an attempt.
    /// Returns the final counters.
    pub async fn shutdown(mut self) -> WorkerStatsSnapshot {
        self.shutdown.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        let stats = self.stats.snapshot();
        info!(?stats, "worker pool stopped");
        stats
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token that stops the pool when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl WorkerPool {
    /// Start `workers_for(step)` pollers per step. Must run inside a tokio runtime.
    pub fn spawn(orchestrator: Arc<Orchestrator>) -> Result<WorkerPoolHandle, OrchestratorError> {
        Self::spawn_with_token(orchestrator, CancellationToken::new())
    }

    /// Like [`WorkerPool::spawn`], stopping when `shutdown` is cancelled.
    pub fn spawn_with_token(
        orchestrator: Arc<Orchestrator>,
        shutdown: CancellationToken,
    ) -> Result<WorkerPoolHandle, OrchestratorError> {
        let stats = Arc::new(WorkerStats::new());
        let mut workers = Vec::new();

        for step in orchestrator.steps() {
            let queue = orchestrator.queue(&step)?.clone();
            let count = orchestrator.settings().workers_for(&step);
            for n in 0..count {
                let worker = StepWorker {
                    step: step.clone(),
                    queue: queue.clone(),
                    orchestrator: orchestrator.clone(),
                    stats: stats.clone(),
                    shutdown: shutdown.clone(),
                    recover: n == 0,
                };
                let span = info_span!("step_worker", step = %step, worker = n);
                workers.push(tokio::spawn(worker.run().instrument(span)));
            }
            info!(step = %step, workers = count, queue = queue.name(), "step workers started");
        }

        Ok(WorkerPoolHandle {
            shutdown,
            workers,
            stats,
        })
    }
}

struct StepWorker {
    step: StepName,
    queue: Arc<dyn MessageQueue>,
    orchestrator: Arc<Orchestrator>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    recover: bool,
}

impl StepWorker {
    async fn run(self) {
        let settings = self.orchestrator.settings();
        let visibility = settings.visibility_timeout;
        let mut backoff = Backoff::new(settings.poll_error_backoff, settings.poll_error_backoff_max);

        if self.recover {
            if let Err(e) = self
                .orchestrator
                .recover_dead_letters(&self.step, RECOVERY_SCAN_LIMIT)
                .await
            {
                self.stats.record_error();
                warn!(error = %e, "dead-letter recovery failed");
            }
        }

        debug!("worker polling");
        while !self.shutdown.is_cancelled() {
            match self.queue.dequeue(visibility).await {
                Ok(Some(delivery)) => {
                    self.stats.record_delivery();
                    match self
                        .orchestrator
                        .process_delivery(&self.step, delivery, &self.shutdown)
                        .await
                    {
                        Ok(disposition) => {
                            backoff.reset();
                            self.stats.record(disposition);
                        }
                        Err(e) => {
                            // The message stays leased and comes back after the
                            // visibility timeout.
                            self.stats.record_error();
                            error!(error = %e, "delivery could not be settled");
                            self.pause(backoff.next()).await;
                        }
                    }
                }
                Ok(None) => backoff.reset(),
                Err(QueueError::DeadLettered {
                    message,
                    delivery_count,
                }) => {
                    self.stats.record_dead_letter();
                    self.settle_dead_letter(&message, delivery_count, &mut backoff)
                        .await;
                }
                Err(e) => {
                    self.stats.record_poll_error();
                    let delay = backoff.next();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "dequeue failed");
                    self.pause(delay).await;
                }
            }
        }
        debug!("worker stopped");
    }

    /// Record the failure of a dead-lettered message, retrying until it sticks.
    ///
    /// The queue has already dropped the message, so a failure given up here
    /// is only picked up again by the startup recovery scan.
    async fn settle_dead_letter(
        &self,
        message: &QueueMessage,
        delivery_count: u32,
        backoff: &mut Backoff,
    ) {
        loop {
            match self
                .orchestrator
                .handle_dead_letter(message, delivery_count)
                .await
            {
                Ok(disposition) => {
                    backoff.reset();
                    self.stats.record(disposition);
                    return;
                }
                Err(e) => {
                    self.stats.record_error();
                    if self.shutdown.is_cancelled() {
                        warn!(
                            error = %e,
                            document_id = %message.document_id,
                            "shutting down before a dead letter was recorded"
                        );
                        return;
                    }
                    let delay = backoff.next();
                    error!(
                        error = %e,
                        document_id = %message.document_id,
                        retry_in_ms = delay.as_millis() as u64,
                        "could not fail the pipeline of a dead-lettered message"
                    );
                    self.pause(delay).await;
                }
            }
        }
    }

    /// Sleep unless shutdown comes first.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Doubling delay between failed polls, capped at `max`.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}
